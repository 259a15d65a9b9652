//! Scripture node variants.

use std::borrow::Cow;
use std::collections::BTreeMap;

use tower_lsp::lsp_types::Range;

/// Extra marker attributes (`|lemma="..."` in USFM, unrecognized keys of a
/// delta attribute object).
pub type Attributes = BTreeMap<String, String>;

/// Character rendered for leaves that have no literal text of their own
/// (chapter and verse numbers, milestones, embeds).
pub const EMBED_PLACEHOLDER: char = '\u{FFFC}';

/// A semantic element of a scripture document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptureNode {
    Document,
    Book {
        code: String,
    },
    Paragraph {
        style: String,
        attrs: Attributes,
    },
    Chapter {
        number: String,
        alt_number: Option<String>,
        pub_number: Option<String>,
    },
    Verse {
        number: String,
        alt_number: Option<String>,
        pub_number: Option<String>,
    },
    Milestone {
        style: String,
        is_start: bool,
        sid: Option<String>,
        eid: Option<String>,
        attrs: Attributes,
    },
    Text {
        text: String,
    },
    CharacterStyle {
        style: String,
        attrs: Attributes,
    },
    Note {
        style: String,
        caller: String,
        category: Option<String>,
    },
    Table,
    Row,
    Cell {
        style: String,
        align: CellAlign,
        col_span: u32,
    },
    Ref {
        display: String,
        target: String,
    },
    OptBreak,
    Sidebar {
        style: String,
        category: Option<String>,
    },
}

/// Discriminant of [`ScriptureNode`], used to filter traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Document,
    Book,
    Paragraph,
    Chapter,
    Verse,
    Milestone,
    Text,
    CharacterStyle,
    Note,
    Table,
    Row,
    Cell,
    Ref,
    OptBreak,
    Sidebar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellAlign {
    #[default]
    Start,
    Center,
    End,
}

impl CellAlign {
    pub fn as_str(self) -> &'static str {
        match self {
            CellAlign::Start => "start",
            CellAlign::Center => "center",
            CellAlign::End => "end",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "center" => CellAlign::Center,
            "end" | "right" => CellAlign::End,
            _ => CellAlign::Start,
        }
    }
}

impl ScriptureNode {
    pub fn node_type(&self) -> NodeType {
        match self {
            ScriptureNode::Document => NodeType::Document,
            ScriptureNode::Book { .. } => NodeType::Book,
            ScriptureNode::Paragraph { .. } => NodeType::Paragraph,
            ScriptureNode::Chapter { .. } => NodeType::Chapter,
            ScriptureNode::Verse { .. } => NodeType::Verse,
            ScriptureNode::Milestone { .. } => NodeType::Milestone,
            ScriptureNode::Text { .. } => NodeType::Text,
            ScriptureNode::CharacterStyle { .. } => NodeType::CharacterStyle,
            ScriptureNode::Note { .. } => NodeType::Note,
            ScriptureNode::Table => NodeType::Table,
            ScriptureNode::Row => NodeType::Row,
            ScriptureNode::Cell { .. } => NodeType::Cell,
            ScriptureNode::Ref { .. } => NodeType::Ref,
            ScriptureNode::OptBreak => NodeType::OptBreak,
            ScriptureNode::Sidebar { .. } => NodeType::Sidebar,
        }
    }

    /// Whether this variant may own children.
    pub fn is_container(&self) -> bool {
        match self {
            ScriptureNode::Document
            | ScriptureNode::Book { .. }
            | ScriptureNode::Paragraph { .. }
            | ScriptureNode::CharacterStyle { .. }
            | ScriptureNode::Note { .. }
            | ScriptureNode::Table
            | ScriptureNode::Row
            | ScriptureNode::Cell { .. }
            | ScriptureNode::Sidebar { .. } => true,
            ScriptureNode::Chapter { .. }
            | ScriptureNode::Verse { .. }
            | ScriptureNode::Milestone { .. }
            | ScriptureNode::Text { .. }
            | ScriptureNode::Ref { .. }
            | ScriptureNode::OptBreak => false,
        }
    }

    /// Literal text of a leaf. `None` for containers.
    pub fn leaf_text(&self) -> Option<Cow<'_, str>> {
        match self {
            ScriptureNode::Text { text } => Some(Cow::Borrowed(text)),
            ScriptureNode::Ref { display, .. } => Some(Cow::Borrowed(display)),
            ScriptureNode::Chapter { .. }
            | ScriptureNode::Verse { .. }
            | ScriptureNode::Milestone { .. }
            | ScriptureNode::OptBreak => Some(Cow::Owned(EMBED_PLACEHOLDER.to_string())),
            _ => None,
        }
    }

    /// Short label used by debug dumps: the variant name plus its key field.
    pub fn label(&self) -> String {
        match self {
            ScriptureNode::Document => "Document".to_string(),
            ScriptureNode::Book { code } => format!("Book {code}"),
            ScriptureNode::Paragraph { style, attrs } => format!("Paragraph {style}{}", fmt_attrs(attrs)),
            ScriptureNode::Chapter { number, .. } => format!("Chapter {number}"),
            ScriptureNode::Verse { number, .. } => format!("Verse {number}"),
            ScriptureNode::Milestone { style, is_start, .. } => {
                format!("Milestone {style}{}", if *is_start { " start" } else { " end" })
            }
            ScriptureNode::Text { text } => format!("Text {text:?}"),
            ScriptureNode::CharacterStyle { style, attrs } => {
                format!("CharacterStyle {style}{}", fmt_attrs(attrs))
            }
            ScriptureNode::Note { style, caller, .. } => format!("Note {style} {caller}"),
            ScriptureNode::Table => "Table".to_string(),
            ScriptureNode::Row => "Row".to_string(),
            ScriptureNode::Cell { style, align, col_span } => {
                format!("Cell {style} {} {col_span}", align.as_str())
            }
            ScriptureNode::Ref { display, target } => format!("Ref {display:?} -> {target}"),
            ScriptureNode::OptBreak => "OptBreak".to_string(),
            ScriptureNode::Sidebar { style, .. } => format!("Sidebar {style}"),
        }
    }
}

fn fmt_attrs(attrs: &Attributes) -> String {
    attrs
        .iter()
        .map(|(key, value)| format!(" {key}={value:?}"))
        .collect()
}

/// An owned subtree not yet attached to a [`ScriptureTree`](super::ScriptureTree).
///
/// Parsers build these; the tree takes ownership when they are appended,
/// inserted or spliced in, and hands them back when nodes are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedNode {
    pub node: ScriptureNode,
    pub range: Range,
    pub children: Vec<DetachedNode>,
}

impl DetachedNode {
    pub fn new(node: ScriptureNode, range: Range) -> Self {
        Self {
            node,
            range,
            children: Vec::new(),
        }
    }

    /// # Panics
    ///
    /// Panics if `node` is a leaf variant and `children` is not empty.
    pub fn with_children(node: ScriptureNode, range: Range, children: Vec<DetachedNode>) -> Self {
        assert!(
            node.is_container() || children.is_empty(),
            "{:?} cannot own children",
            node.node_type()
        );
        Self {
            node,
            range,
            children,
        }
    }

    pub fn text(text: impl Into<String>, range: Range) -> Self {
        Self::new(ScriptureNode::Text { text: text.into() }, range)
    }
}
