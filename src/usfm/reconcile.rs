//! Keeps a USFM document's tree and line table in step with text edits.

use tower_lsp::lsp_types::{Position, Range};
use tracing::{debug, trace};

use super::parser::{self, ParsedUsfm};
use crate::document::TextPositionIndex;
use crate::error::Result;
use crate::settings::UsfmSettings;
use crate::tree::{NodeId, NodeType, ScriptureTree};

/// Per-line table used to find what to re-parse.
///
/// `line_nodes[line]` is the index, among the root's children, of the first
/// node whose range ends on or after `line`.
#[derive(Debug, Clone, Default)]
pub struct UsfmReconciler {
    line_nodes: Vec<usize>,
}

/// Root children `first..end` and the span of text they are re-parsed from.
#[derive(Debug, Clone, Copy)]
struct Window {
    first: usize,
    end: usize,
    start: Position,
    stop: Position,
}

impl UsfmReconciler {
    /// Parse a whole document.
    pub(crate) fn create(
        text: String,
        settings: &UsfmSettings,
    ) -> Result<(Self, TextPositionIndex, ScriptureTree)> {
        let parsed = parser::parse(&text, Position::default(), settings)?;
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.splice_children(root, 0, 0, parsed.nodes);
        tree.set_range(root, Range::new(Position::default(), parsed.end));
        let index = TextPositionIndex::new(text);

        let children = tree.children(root);
        let line_nodes = (0..index.line_count() as u32)
            .map(|line| first_ending_on_or_after(&tree, children, line))
            .collect();
        trace!(
            lines = index.line_count(),
            nodes = children.len(),
            "parsed usfm document"
        );
        Ok((Self { line_nodes }, index, tree))
    }

    pub fn line_nodes(&self) -> &[usize] {
        &self.line_nodes
    }

    /// Replace `range` with `text` and re-parse only the top-level nodes the
    /// edit touches.
    ///
    /// Nothing is modified when an error is returned.
    pub(crate) fn update(
        &mut self,
        range: Range,
        text: &str,
        settings: &UsfmSettings,
        index: &mut TextPositionIndex,
        tree: &mut ScriptureTree,
    ) -> Result<()> {
        let (from, to) = if range.end < range.start {
            (range.end, range.start)
        } else {
            (range.start, range.end)
        };
        let edit_start = index.offset_at(from);
        let edit_end = index.offset_at(to).max(edit_start);
        let from = index.position_at(edit_start, None);
        let to = index.position_at(edit_end, None);

        let root = tree.root();
        let children = tree.children(root);
        let mut window = self.window(from, to, tree, index);

        // Grow the window until its edges are boundaries a whole-document
        // parse would also see.
        let parsed = loop {
            let stop = index.offset_at(window.stop);
            let window_text = format!(
                "{}{}{}",
                index.slice(index.offset_at(window.start), edit_start),
                text,
                index.slice(edit_end, stop),
            );
            let following = lookahead(index.slice(stop, index.len()));
            match parser::parse_window(&window_text, following, window.start, settings) {
                Ok(parsed) => {
                    if !self.grow(&mut window, &parsed, tree, children) {
                        break parsed;
                    }
                }
                // The opener of a closing marker may sit in the node before the
                // window, and a word the window is missing in the node after it.
                Err(error) => {
                    if window.first > 0 && parser::continues_previous(&window_text, following, settings) {
                        window.first -= 1;
                    } else if window.end < children.len()
                        && runs_on(tree.node(children[window.end]).node_type())
                    {
                        window.end += 1;
                    } else {
                        return Err(error);
                    }
                }
            }
            window.span(tree, index);
            trace!(?window, "widened usfm window");
        };
        debug!(
            nodes = ?(window.first..window.end),
            new_nodes = parsed.nodes.len(),
            lines = ?(window.start.line..=window.stop.line),
            "re-parsed usfm window"
        );

        index.replace(edit_start, edit_end, text);

        let removed = window.end - window.first;
        let inserted = parsed.nodes.len();
        tree.splice_children(root, window.first, removed, parsed.nodes);
        let old_stop = window.stop;
        let new_stop = parsed.end;
        if old_stop != new_stop {
            let following: Vec<NodeId> = tree.children(root)[window.first + inserted..].to_vec();
            for id in following {
                tree.map_positions(id, &|position| shift(position, old_stop, new_stop));
            }
        }

        let node_delta = inserted as isize - removed as isize;
        let tail: Vec<usize> = self.line_nodes[old_stop.line as usize + 1..]
            .iter()
            .map(|entry| entry.wrapping_add_signed(node_delta))
            .collect();
        let children = tree.children(root);
        self.line_nodes.truncate(window.start.line as usize + 1);
        self.line_nodes.extend(
            (window.start.line + 1..=new_stop.line)
                .map(|line| first_ending_on_or_after(tree, children, line)),
        );
        self.line_nodes.extend(tail);

        tree.set_range(
            root,
            Range::new(Position::default(), index.position_at(index.len(), None)),
        );
        debug_assert_eq!(self.line_nodes.len(), index.line_count());
        Ok(())
    }

    /// Top-level nodes overlapping `from..to`, and the text span covering both
    /// them and the edit.
    fn window(&self, from: Position, to: Position, tree: &ScriptureTree, index: &TextPositionIndex) -> Window {
        let children = tree.children(tree.root());
        let starts_at = |node: usize| tree.range(children[node]).start;

        let mut first = self
            .line_nodes
            .get(from.line as usize)
            .copied()
            .unwrap_or(children.len())
            .min(children.len());
        if first > 0 && (first == children.len() || starts_at(first) > from) {
            first -= 1;
        }
        let mut end = first;
        while end < children.len() && starts_at(end) <= to {
            end += 1;
        }

        let mut window = Window {
            first,
            end,
            start: from,
            stop: to,
        };
        window.span(tree, index);
        trace!(?from, ?to, ?window, "usfm window");
        window
    }

    /// Take in the neighbours a whole-document parse would have merged with
    /// the window. Returns whether the window changed.
    fn grow(&self, window: &mut Window, parsed: &ParsedUsfm, tree: &ScriptureTree, children: &[NodeId]) -> bool {
        let mut grew = false;
        if parsed.continues_previous && window.first > 0 {
            window.first -= 1;
            grew = true;
        }
        if let Some(&next) = children.get(window.end) {
            let joins = match tree.node(next).node_type() {
                NodeType::Table => parsed.ends_in_table,
                node_type => runs_on(node_type),
            };
            if parsed.open_sidebar {
                window.end = children.len();
                grew = true;
            } else if joins {
                window.end += 1;
                grew = true;
            }
        }
        grew
    }
}

impl Window {
    /// Stretch `start..stop` over the window's nodes. The window starts at the
    /// document start or at its first node, and runs up to the next node or
    /// the document end, so the blanks between nodes are parsed in context.
    fn span(&mut self, tree: &ScriptureTree, index: &TextPositionIndex) {
        let children = tree.children(tree.root());
        self.start = match self.first {
            0 => Position::default(),
            first => self.start.min(tree.range(children[first]).start),
        };
        self.stop = match children.get(self.end) {
            Some(&next) => tree.range(next).start,
            None => index.position_at(index.len(), None),
        };
    }
}

/// Whether a top-level node of this type can belong to whatever comes before
/// it. Books, chapters, paragraphs and sidebars always start afresh, tables
/// only when no table is open.
fn runs_on(node_type: NodeType) -> bool {
    !matches!(
        node_type,
        NodeType::Book | NodeType::Chapter | NodeType::Paragraph | NodeType::Sidebar | NodeType::Table
    )
}

/// The part of `rest` that can change how the text before it tokenizes: up
/// to the end of the line holding the next marker.
fn lookahead(rest: &str) -> &str {
    let marker = match (rest.find('\\'), rest.find("//")) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b).unwrap_or(rest.len()),
    };
    let line_end = rest[marker..]
        .find(['\n', '\r'])
        .map_or(rest.len(), |i| marker + i);
    &rest[..line_end]
}

/// Index of the first of `children` whose range ends on or after `line`.
fn first_ending_on_or_after(tree: &ScriptureTree, children: &[NodeId], line: u32) -> usize {
    children.partition_point(|&id| tree.range(id).end.line < line)
}

/// Move a position that followed `old_stop` so it follows `new_stop`.
fn shift(position: Position, old_stop: Position, new_stop: Position) -> Position {
    if position.line == old_stop.line {
        Position::new(
            new_stop.line,
            new_stop.character + position.character.saturating_sub(old_stop.character),
        )
    } else {
        Position::new(position.line + new_stop.line - old_stop.line, position.character)
    }
}
