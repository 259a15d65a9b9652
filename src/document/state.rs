//! Document state management for scripture documents.

use std::sync::Arc;

use dashmap::DashMap;
use tower_lsp::lsp_types::{Position, Range, TextDocumentContentChangeEvent, Url};
use tracing::debug;

use crate::delta::{Delta, DeltaReconciler, Op, OpCursor};
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::tree::{Descendants, NodeId, NodeRef, NodeType, ScriptureTree};
use crate::usfm::UsfmReconciler;

use super::text::TextPositionIndex;

/// Source format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    /// Rich-text op stream, exchanged as JSON.
    Delta,
    /// USFM marker text.
    Usfm,
}

impl DocumentFormat {
    /// Guess the format from a URI's extension: `.usfm` and `.sfm` files are
    /// USFM, everything else is an op stream.
    pub fn from_uri(uri: &Url) -> Self {
        let path = uri.path().to_ascii_lowercase();
        if path.ends_with(".usfm") || path.ends_with(".sfm") {
            DocumentFormat::Usfm
        } else {
            DocumentFormat::Delta
        }
    }
}

/// One edit to a document.
#[derive(Debug, Clone)]
pub enum DocumentChange {
    /// Op stream change. Only valid for delta documents.
    Delta(Delta),
    /// Replace `range` with `text`. Without a range the text replaces the
    /// whole document, like [`DocumentChange::Replace`].
    Text { range: Option<Range>, text: String },
    /// New content for the whole document: op JSON for delta documents,
    /// marker text for USFM documents.
    Replace(String),
}

impl From<TextDocumentContentChangeEvent> for DocumentChange {
    fn from(event: TextDocumentContentChangeEvent) -> Self {
        DocumentChange::Text {
            range: event.range,
            text: event.text,
        }
    }
}

impl From<Delta> for DocumentChange {
    fn from(delta: Delta) -> Self {
        DocumentChange::Delta(delta)
    }
}

#[derive(Debug, Clone)]
enum Reconciler {
    Delta(DeltaReconciler),
    Usfm(UsfmReconciler),
}

/// A scripture document: its text, its node tree and the tables that keep
/// them in step.
#[derive(Debug, Clone)]
pub struct Document {
    uri: Url,
    format: DocumentFormat,
    version: i32,
    index: TextPositionIndex,
    tree: ScriptureTree,
    reconciler: Reconciler,
    settings: Arc<Settings>,
}

impl Document {
    /// Parse `content` with default settings.
    pub fn create(uri: Url, format: DocumentFormat, version: i32, content: String) -> Result<Self> {
        Self::create_with_settings(uri, format, version, content, Arc::new(Settings::default()))
    }

    pub fn create_with_settings(
        uri: Url,
        format: DocumentFormat,
        version: i32,
        content: String,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let (reconciler, index, tree) = parse(format, content, &settings)?;
        debug!(
            %uri,
            ?format,
            version,
            lines = index.line_count(),
            nodes = tree.children(tree.root()).len(),
            "created document"
        );
        Ok(Self {
            uri,
            format,
            version,
            index,
            tree,
            reconciler,
            settings,
        })
    }

    /// Apply `change` and move to `version`, returning the new version.
    ///
    /// On error the document keeps its previous text, tree and version.
    pub fn update(&mut self, change: DocumentChange, version: i32) -> Result<i32> {
        if version <= self.version {
            return Err(Error::StaleVersion {
                current: self.version,
                new: version,
            });
        }

        match change {
            DocumentChange::Replace(content)
            | DocumentChange::Text {
                range: None,
                text: content,
            } => {
                let (reconciler, index, tree) = parse(self.format, content, &self.settings)?;
                self.reconciler = reconciler;
                self.index = index;
                self.tree = tree;
            }
            DocumentChange::Text {
                range: Some(range),
                text,
            } => match &mut self.reconciler {
                Reconciler::Delta(reconciler) => {
                    let delta = text_change_delta(&self.index, range, text);
                    reconciler.update(&delta, &self.settings.delta, &mut self.index, &mut self.tree)?;
                }
                Reconciler::Usfm(reconciler) => {
                    reconciler.update(range, &text, &self.settings.usfm, &mut self.index, &mut self.tree)?;
                }
            },
            DocumentChange::Delta(delta) => match &mut self.reconciler {
                Reconciler::Delta(reconciler) => {
                    reconciler.update(&delta, &self.settings.delta, &mut self.index, &mut self.tree)?;
                }
                Reconciler::Usfm(_) => {
                    return Err(Error::FormatMismatch {
                        change: "delta",
                        format: self.format,
                    });
                }
            },
        }

        debug!(uri = %self.uri, from = self.version, to = version, "updated document");
        self.version = version;
        Ok(version)
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn tree(&self) -> &ScriptureTree {
        &self.tree
    }

    pub fn index(&self) -> &TextPositionIndex {
        &self.index
    }

    /// Text covered by `range`, or the whole document.
    pub fn get_text(&self, range: Option<Range>) -> &str {
        self.index.get_text(range)
    }

    pub fn offset_at(&self, position: Position) -> usize {
        self.index.offset_at(position)
    }

    pub fn position_at(&self, offset: usize, range: Option<Range>) -> Position {
        self.index.position_at(offset, range)
    }

    /// Every node below the root, depth first.
    pub fn nodes(&self) -> Descendants<'_> {
        self.tree.nodes(self.tree.root())
    }

    /// Nodes of `node_type`, or every node when it is `None`, in document
    /// order.
    pub fn find_nodes(&self, node_type: Option<NodeType>) -> impl Iterator<Item = NodeRef<'_>> {
        self.nodes()
            .filter(move |node| node_type.map_or(true, |wanted| node.node_type() == wanted))
    }

    /// Position `offset` characters into `node`, clamped to its range.
    pub fn node_position_at(&self, node: NodeId, offset: usize) -> Position {
        let range = self.tree.range(node);
        let start = self.index.offset_at(range.start);
        self.index.position_at(start.saturating_add(offset), Some(range))
    }

    /// Root child index per line.
    pub fn line_nodes(&self) -> &[usize] {
        match &self.reconciler {
            Reconciler::Delta(reconciler) => reconciler.line_nodes(),
            Reconciler::Usfm(reconciler) => reconciler.line_nodes(),
        }
    }

    /// Op cursor per line. `None` for USFM documents.
    pub fn line_ops(&self) -> Option<&[OpCursor]> {
        match &self.reconciler {
            Reconciler::Delta(reconciler) => Some(reconciler.line_ops()),
            Reconciler::Usfm(_) => None,
        }
    }

    /// Current op stream. `None` for USFM documents.
    pub fn ops(&self) -> Option<&Delta> {
        match &self.reconciler {
            Reconciler::Delta(reconciler) => Some(reconciler.ops()),
            Reconciler::Usfm(_) => None,
        }
    }
}

fn parse(
    format: DocumentFormat,
    content: String,
    settings: &Settings,
) -> Result<(Reconciler, TextPositionIndex, ScriptureTree)> {
    match format {
        DocumentFormat::Delta => {
            let delta = Delta::from_json(&content)?;
            let (reconciler, index, tree) = DeltaReconciler::create(delta, &settings.delta)?;
            Ok((Reconciler::Delta(reconciler), index, tree))
        }
        DocumentFormat::Usfm => {
            let (reconciler, index, tree) = UsfmReconciler::create(content, &settings.usfm)?;
            Ok((Reconciler::Usfm(reconciler), index, tree))
        }
    }
}

/// Express a text replacement as an op stream change.
fn text_change_delta(index: &TextPositionIndex, range: Range, text: String) -> Delta {
    let (from, to) = if range.end < range.start {
        (range.end, range.start)
    } else {
        (range.start, range.end)
    };
    let start = index.offset_at(from);
    let end = index.offset_at(to).max(start);

    let mut delta = Delta::new();
    if start > 0 {
        delta.push(Op::retain(start));
    }
    if end > start {
        delta.push(Op::delete(end - start));
    }
    if !text.is_empty() {
        delta.push(Op::insert(text));
    }
    delta
}

/// Thread-safe storage for open documents.
///
/// Updates hold the document's shard lock, so edits to one document are
/// applied one at a time.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<Url, Document>,
    settings: Arc<Settings>,
}

impl DocumentStore {
    /// Create a new empty document store.
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            documents: DashMap::new(),
            settings: Arc::new(settings),
        }
    }

    /// Open or reopen a document, picking the format from the URI.
    pub fn open(&self, uri: Url, content: String, version: i32) -> Result<()> {
        let format = DocumentFormat::from_uri(&uri);
        self.open_with_format(uri, format, content, version)
    }

    pub fn open_with_format(
        &self,
        uri: Url,
        format: DocumentFormat,
        content: String,
        version: i32,
    ) -> Result<()> {
        let document = Document::create_with_settings(
            uri.clone(),
            format,
            version,
            content,
            Arc::clone(&self.settings),
        )?;
        self.documents.insert(uri, document);
        Ok(())
    }

    /// Apply a change to an open document. `None` if `uri` is not open.
    pub fn update(&self, uri: &Url, change: DocumentChange, version: i32) -> Option<Result<i32>> {
        let mut document = self.documents.get_mut(uri)?;
        Some(document.update(change, version))
    }

    /// Close a document.
    pub fn close(&self, uri: &Url) {
        self.documents.remove(uri);
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.documents.contains_key(uri)
    }

    /// Run `f` against an open document.
    pub fn with_document<R>(&self, uri: &Url, f: impl FnOnce(&Document) -> R) -> Option<R> {
        self.documents.get(uri).map(|document| f(&document))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tree::ScriptureNode;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///project/{name}")).unwrap()
    }

    fn usfm(text: &str) -> Document {
        Document::create(uri("MAT.usfm"), DocumentFormat::Usfm, 1, text.to_string()).unwrap()
    }

    fn delta(ops: serde_json::Value) -> Document {
        Document::create(uri("doc.json"), DocumentFormat::Delta, 1, ops.to_string()).unwrap()
    }

    fn range(start: (u32, u32), end: (u32, u32)) -> Range {
        Range::new(Position::new(start.0, start.1), Position::new(end.0, end.1))
    }

    #[test]
    fn format_from_uri() {
        assert_eq!(DocumentFormat::from_uri(&uri("41MATWEB.SFM")), DocumentFormat::Usfm);
        assert_eq!(DocumentFormat::from_uri(&uri("MAT.usfm")), DocumentFormat::Usfm);
        assert_eq!(DocumentFormat::from_uri(&uri("MAT.json")), DocumentFormat::Delta);
    }

    #[test]
    fn versions_must_increase() {
        let mut document = usfm("\\p a");
        let result = document.update(DocumentChange::Replace("\\p b".to_string()), 1);
        assert!(matches!(result, Err(Error::StaleVersion { current: 1, new: 1 })));
        assert_eq!(document.get_text(None), "\\p a");
        assert_eq!(document.update(DocumentChange::Replace("\\p b".to_string()), 2).unwrap(), 2);
        assert_eq!(document.version(), 2);
    }

    #[test]
    fn delta_change_on_usfm_document() {
        let mut document = usfm("\\p a");
        let result = document.update(Delta::from(vec![Op::insert("x")]).into(), 2);
        assert!(matches!(
            result,
            Err(Error::FormatMismatch {
                change: "delta",
                format: DocumentFormat::Usfm
            })
        ));
        assert_eq!(document.version(), 1);
    }

    #[test]
    fn failed_update_keeps_version() {
        let mut document = usfm("\\c 1\n\\p a");
        let change = DocumentChange::Text {
            range: Some(range((0, 3), (0, 4))),
            text: String::new(),
        };
        assert!(document.update(change, 2).is_err());
        assert_eq!(document.version(), 1);
        assert_eq!(document.get_text(None), "\\c 1\n\\p a");
    }

    #[test]
    fn text_change_on_delta_document() {
        let mut document = delta(json!({"ops": [{"insert": "Hello\nWorld\n"}]}));
        let change = DocumentChange::Text {
            range: Some(range((1, 0), (1, 5))),
            text: "There".to_string(),
        };
        document.update(change, 2).unwrap();
        assert_eq!(document.get_text(None), "Hello\nThere\n");
        let ops = document.ops().unwrap();
        assert_eq!(ops.char_len(), 12);
        assert_eq!(document.line_ops().map(<[OpCursor]>::len), Some(3));
    }

    #[test]
    fn find_nodes_filters_by_type() {
        let document = usfm("\\c 1\n\\p\n\\v 1 a\n\\v 2 b\n");
        assert_eq!(document.find_nodes(Some(NodeType::Verse)).count(), 2);
        assert_eq!(document.find_nodes(None).count(), document.nodes().count());
        let numbers: Vec<String> = document
            .find_nodes(Some(NodeType::Verse))
            .map(|node| match node.node() {
                ScriptureNode::Verse { number, .. } => number.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(numbers, ["1", "2"]);
    }

    #[test]
    fn node_position_at_is_clamped_to_node() {
        let document = usfm("\\p\n\\v 1 In the beginning");
        let text = document.find_nodes(Some(NodeType::Text)).next().unwrap();
        assert_eq!(text.range(), range((1, 5), (1, 21)));
        assert_eq!(document.node_position_at(text.id(), 3), Position::new(1, 8));
        assert_eq!(document.node_position_at(text.id(), 100), Position::new(1, 21));
    }

    #[test]
    fn store_serializes_updates_per_document() {
        let store = DocumentStore::new();
        let mat = uri("MAT.usfm");
        store.open(mat.clone(), "\\p a".to_string(), 1).unwrap();
        assert!(store.contains(&mat));

        let change = DocumentChange::Text {
            range: Some(range((0, 3), (0, 4))),
            text: "b".to_string(),
        };
        assert_eq!(store.update(&mat, change, 2).map(Result::ok), Some(Some(2)));
        assert_eq!(
            store.with_document(&mat, |document| document.get_text(None).to_string()),
            Some("\\p b".to_string())
        );
        assert!(store.update(&uri("other.usfm"), DocumentChange::Replace(String::new()), 2).is_none());

        store.close(&mat);
        assert!(!store.contains(&mat));
    }
}
