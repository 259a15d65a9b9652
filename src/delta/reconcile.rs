//! Keeps a delta document's tree and line tables in step with its ops.

use tower_lsp::lsp_types::{Position, Range};
use tracing::{debug, trace};

use super::op::{Delta, OpCursor, OpKind};
use super::parser::{self, ParseWindow};
use crate::document::TextPositionIndex;
use crate::error::{Error, Result};
use crate::settings::DeltaSettings;
use crate::tree::{NodeId, NodeType, ScriptureTree};

/// Op stream plus the per-line tables used to find what to re-parse.
///
/// `line_ops[line]` is the op cursor where the line's first character lives.
/// `line_nodes[line]` is the index, among the root's children, of the node
/// holding the line's start (or of the next node when the line is empty and
/// last).
#[derive(Debug, Clone)]
pub struct DeltaReconciler {
    ops: Delta,
    line_ops: Vec<OpCursor>,
    line_nodes: Vec<usize>,
}

/// Span of a change in document coordinates.
#[derive(Debug, Clone, Copy)]
struct ChangeExtent {
    start: usize,
    end: usize,
    inserted: usize,
    deleted: usize,
}

impl ChangeExtent {
    /// `None` when the change only retains.
    fn of(change: &Delta, len: usize) -> Result<Option<Self>> {
        let mut offset = 0usize;
        let mut extent: Option<ChangeExtent> = None;
        for op in &change.ops {
            let plain_retain = matches!(op.kind, OpKind::Retain(_)) && op.attributes.is_none();
            if !plain_retain {
                extent.get_or_insert(ChangeExtent {
                    start: offset,
                    end: offset,
                    inserted: 0,
                    deleted: 0,
                });
            }
            match op.kind {
                OpKind::Insert(_) => {
                    if let Some(extent) = &mut extent {
                        extent.inserted += op.len();
                        extent.end = offset;
                    }
                }
                OpKind::Retain(count) => {
                    offset = offset.saturating_add(count);
                    if !plain_retain {
                        if let Some(extent) = &mut extent {
                            extent.end = offset;
                        }
                    }
                }
                OpKind::Delete(count) => {
                    offset = offset.saturating_add(count);
                    if let Some(extent) = &mut extent {
                        extent.deleted += count;
                        extent.end = offset;
                    }
                }
            }
            if offset > len {
                return Err(Error::ChangeOutOfBounds { end: offset, len });
            }
        }
        Ok(extent)
    }
}

/// Lines `start_line..=end_line` and the root children they map to.
#[derive(Debug, Clone, Copy)]
struct Window {
    start_line: usize,
    end_line: usize,
    node_start: usize,
    node_end: usize,
    start_offset: usize,
    end_offset: usize,
}

impl DeltaReconciler {
    /// Parse a whole document.
    pub(crate) fn create(
        delta: Delta,
        settings: &DeltaSettings,
    ) -> Result<(Self, TextPositionIndex, ScriptureTree)> {
        delta.ensure_document()?;
        let ops = delta.compact();
        let parsed = parser::parse(&ops.ops, ParseWindow::whole(), settings)?;

        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.splice_children(root, 0, 0, parsed.nodes);
        tree.set_range(root, Range::new(Position::default(), parsed.end));
        let index = TextPositionIndex::new(parsed.text);
        trace!(
            ops = ops.len(),
            lines = parsed.line_nodes.len(),
            nodes = tree.children(root).len(),
            "parsed delta document"
        );

        let reconciler = Self {
            ops,
            line_ops: parsed.line_ops,
            line_nodes: parsed.line_nodes,
        };
        Ok((reconciler, index, tree))
    }

    pub fn ops(&self) -> &Delta {
        &self.ops
    }

    pub fn line_ops(&self) -> &[OpCursor] {
        &self.line_ops
    }

    pub fn line_nodes(&self) -> &[usize] {
        &self.line_nodes
    }

    /// Apply `change` and re-parse only the lines it touches.
    ///
    /// Nothing is modified when an error is returned.
    pub(crate) fn update(
        &mut self,
        change: &Delta,
        settings: &DeltaSettings,
        index: &mut TextPositionIndex,
        tree: &mut ScriptureTree,
    ) -> Result<()> {
        let Some(extent) = ChangeExtent::of(change, index.len())? else {
            trace!("change only retains");
            return Ok(());
        };
        let composed = self.ops.compose(change);
        composed.ensure_document()?;

        let window = self.window(extent, index, tree);
        let length = window.end_offset - window.start_offset + extent.inserted - extent.deleted;
        let parse_window = ParseWindow {
            position: Position::new(window.start_line as u32, 0),
            offset: window.start_offset,
            node_index: window.node_start,
            cursor: self.stable_cursor(window.start_line),
            length,
        };
        let mut parsed = parser::parse(&composed.ops, parse_window, settings)?;
        debug!(
            lines = ?(window.start_line..=window.end_line),
            nodes = ?(window.node_start..window.node_end),
            new_nodes = parsed.nodes.len(),
            "re-parsed delta window"
        );

        // The last entry belongs to the line after the window, which is kept.
        let old_lines = window.end_line + 1 - window.start_line;
        if window.end_line + 1 < self.line_nodes.len() {
            let next_line = window.end_line + 1;
            if let Some(new_first) = parsed.line_ops.pop() {
                let old_first = self.line_ops[next_line];
                for cursor in &mut self.line_ops[next_line..] {
                    *cursor = if cursor.index == old_first.index {
                        OpCursor {
                            index: new_first.index,
                            skip: cursor.skip - old_first.skip + new_first.skip,
                        }
                    } else {
                        OpCursor {
                            index: cursor.index - old_first.index + new_first.index,
                            skip: cursor.skip,
                        }
                    };
                }
            }
            parsed.line_nodes.pop();
        }
        let new_lines = parsed.line_nodes.len();
        let removed = window.node_end - window.node_start;
        let inserted = parsed.nodes.len();
        let node_delta = inserted as isize - removed as isize;
        for entry in &mut self.line_nodes[window.end_line + 1..] {
            *entry = entry.wrapping_add_signed(node_delta);
        }
        self.line_ops
            .splice(window.start_line..=window.end_line, parsed.line_ops);
        self.line_nodes
            .splice(window.start_line..=window.end_line, parsed.line_nodes);

        let root = tree.root();
        tree.splice_children(root, window.node_start, removed, parsed.nodes);
        let line_delta = new_lines as i64 - old_lines as i64;
        if line_delta != 0 {
            let following: Vec<NodeId> = tree.children(root)[window.node_start + inserted..].to_vec();
            for id in following {
                tree.map_positions(id, &|position| {
                    Position::new((position.line as i64 + line_delta) as u32, position.character)
                });
            }
        }

        index.replace(window.start_offset, window.end_offset, &parsed.text);
        tree.set_range(
            root,
            Range::new(Position::default(), index.position_at(index.len(), None)),
        );
        self.ops = composed;
        debug_assert_eq!(self.line_nodes.len(), index.line_count());
        Ok(())
    }

    /// Find the lines and root children a change touches, widened until both
    /// edges fall on node boundaries.
    fn window(&self, extent: ChangeExtent, index: &TextPositionIndex, tree: &ScriptureTree) -> Window {
        let line_count = self.line_nodes.len();
        let children = tree.children(tree.root());
        let is_table = |node: usize| {
            children
                .get(node)
                .is_some_and(|&id| tree.node(id).node_type() == NodeType::Table)
        };

        let mut start_line = index.position_at(extent.start, None).line as usize;
        let mut end_line = index.position_at(extent.end, None).line as usize;
        while start_line > 0 && self.line_nodes[start_line - 1] == self.line_nodes[start_line] {
            start_line -= 1;
        }
        while end_line + 1 < line_count && self.line_nodes[end_line + 1] == self.line_nodes[end_line] {
            end_line += 1;
        }

        // New cells next to a table join it, so re-parse adjacent tables too.
        if let Some(previous) = self.line_nodes[start_line].checked_sub(1) {
            if is_table(previous) {
                while start_line > 0 && self.line_nodes[start_line - 1] >= previous {
                    start_line -= 1;
                }
            }
        }
        if let Some(&next) = self.line_nodes.get(end_line + 1) {
            if is_table(next) {
                while end_line + 1 < line_count && self.line_nodes[end_line + 1] <= next {
                    end_line += 1;
                }
            }
        }

        let offsets = index.line_offsets();
        let window = Window {
            start_line,
            end_line,
            node_start: self.line_nodes[start_line],
            node_end: self
                .line_nodes
                .get(end_line + 1)
                .copied()
                .unwrap_or(children.len()),
            start_offset: offsets[start_line],
            end_offset: offsets.get(end_line + 1).copied().unwrap_or(index.len()),
        };
        trace!(?extent, ?window, "delta window");
        window
    }

    /// Cursor for the start of `line` that survives composition.
    ///
    /// Inserts at an op boundary merge into the op before it, so a line that
    /// starts an op is addressed as the end of the previous op instead.
    fn stable_cursor(&self, line: usize) -> OpCursor {
        let cursor = self.line_ops[line];
        match cursor.index.checked_sub(1) {
            Some(previous) if cursor.skip == 0 => OpCursor {
                index: previous,
                skip: self.ops.ops[previous].len(),
            },
            _ => cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::delta::Op;
    use crate::tree::DetachedNode;

    struct Fixture {
        reconciler: DeltaReconciler,
        index: TextPositionIndex,
        tree: ScriptureTree,
        settings: DeltaSettings,
    }

    impl Fixture {
        fn new(ops: Vec<Op>) -> Self {
            let settings = DeltaSettings::default();
            let (reconciler, index, tree) = DeltaReconciler::create(Delta::from(ops), &settings).unwrap();
            Self {
                reconciler,
                index,
                tree,
                settings,
            }
        }

        fn apply(&mut self, change: Vec<Op>) -> Result<()> {
            self.reconciler.update(
                &Delta::from(change),
                &self.settings,
                &mut self.index,
                &mut self.tree,
            )
        }

        fn children(&self) -> Vec<NodeId> {
            self.tree.children(self.tree.root()).to_vec()
        }

        fn snapshot(&self) -> DetachedNode {
            self.tree.to_detached(self.tree.root())
        }

        /// The incremental result must equal a full parse of the same ops.
        fn assert_consistent(&self) {
            let (fresh, index, tree) =
                DeltaReconciler::create(self.reconciler.ops.clone(), &self.settings).unwrap();
            assert_eq!(self.index.text(), index.text());
            assert_eq!(self.index.line_offsets(), index.line_offsets());
            assert_eq!(self.snapshot(), tree.to_detached(tree.root()));
            assert_eq!(self.reconciler.line_ops, fresh.line_ops);
            assert_eq!(self.reconciler.line_nodes, fresh.line_nodes);
        }
    }

    fn three_paragraphs() -> Vec<Op> {
        vec![
            Op::insert("First"),
            Op::insert_with("\n", json!({"para": {"style": "s1"}})),
            Op::insert("Second\nThird\n"),
        ]
    }

    #[test]
    fn edit_inside_paragraph_keeps_siblings() {
        let mut fixture = Fixture::new(three_paragraphs());
        let before = fixture.children();
        fixture.apply(vec![Op::retain(8), Op::insert("X")]).unwrap();
        let after = fixture.children();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], before[0]);
        assert_eq!(after[2], before[2]);
        assert_eq!(fixture.index.text(), "First\nSeXcond\nThird\n");
        fixture.assert_consistent();
    }

    #[test]
    fn splitting_a_paragraph_shifts_following_nodes() {
        let mut fixture = Fixture::new(three_paragraphs());
        let third = fixture.children()[2];
        fixture.apply(vec![Op::retain(9), Op::insert("\n")]).unwrap();
        assert_eq!(fixture.children().len(), 4);
        assert_eq!(fixture.children()[3], third);
        assert_eq!(fixture.tree.range(third).start, Position::new(3, 0));
        fixture.assert_consistent();
    }

    #[test]
    fn joining_paragraphs() {
        let mut fixture = Fixture::new(three_paragraphs());
        fixture.apply(vec![Op::retain(12), Op::delete(1)]).unwrap();
        assert_eq!(fixture.children().len(), 2);
        assert_eq!(fixture.index.text(), "First\nSecondThird\n");
        fixture.assert_consistent();
    }

    #[test]
    fn removing_a_paragraph_across_ops() {
        let mut fixture = Fixture::new(three_paragraphs());
        fixture.apply(vec![Op::delete(6)]).unwrap();
        assert_eq!(fixture.index.text(), "Second\nThird\n");
        fixture.assert_consistent();
    }

    #[test]
    fn typing_at_end_of_document() {
        let mut fixture = Fixture::new(three_paragraphs());
        fixture.apply(vec![Op::retain(19), Op::insert("tail")]).unwrap();
        let children = fixture.children();
        assert_eq!(children.len(), 4);
        assert_eq!(fixture.tree.node(children[3]).node_type(), NodeType::Text);
        fixture.assert_consistent();
    }

    #[test]
    fn insert_at_op_boundary_merges_into_previous_op() {
        let mut fixture = Fixture::new(vec![
            Op::insert("Hello\n"),
            Op::embed(json!({"verse": {"number": "1"}})),
            Op::insert("x\n"),
        ]);
        fixture.apply(vec![Op::retain(6), Op::insert("Y")]).unwrap();
        assert_eq!(fixture.reconciler.ops.len(), 3);
        assert_eq!(fixture.reconciler.line_ops[1], OpCursor { index: 0, skip: 6 });
        fixture.assert_consistent();
    }

    #[test]
    fn paragraph_style_change_through_retain() {
        let mut fixture = Fixture::new(three_paragraphs());
        fixture
            .apply(vec![Op::retain(12), Op::retain_with(1, json!({"para": {"style": "q1"}}))])
            .unwrap();
        let second = fixture.children()[1];
        assert!(matches!(
            fixture.tree.node(second),
            crate::tree::ScriptureNode::Paragraph { style, .. } if style == "q1"
        ));
        fixture.assert_consistent();
    }

    #[test]
    fn new_cell_joins_preceding_table() {
        let cell = json!({"table": {"id": "t1"}, "row": {"id": "r1"}, "cell": {"style": "tc1"}});
        let mut fixture = Fixture::new(vec![
            Op::insert("a"),
            Op::insert_with("\n", cell.clone()),
            Op::insert("after\n"),
        ]);
        // Turn "after" into a second cell of the same row.
        fixture.apply(vec![Op::retain(7), Op::retain_with(1, cell)]).unwrap();
        let children = fixture.children();
        assert_eq!(children.len(), 1);
        assert_eq!(fixture.tree.nodes(children[0]).filter(|n| n.node_type() == NodeType::Cell).count(), 2);
        fixture.assert_consistent();
    }

    #[test]
    fn multi_line_replacement() {
        let mut fixture = Fixture::new(three_paragraphs());
        fixture
            .apply(vec![Op::retain(3), Op::delete(12), Op::insert("a\nb\nc")])
            .unwrap();
        assert_eq!(fixture.index.text(), "Fira\nb\ncird\n");
        fixture.assert_consistent();
    }

    #[test]
    fn out_of_bounds_change_leaves_document_untouched() {
        let mut fixture = Fixture::new(three_paragraphs());
        let before = fixture.snapshot();
        let result = fixture.apply(vec![Op::retain(50), Op::insert("x")]);
        assert!(matches!(result, Err(Error::ChangeOutOfBounds { end: 50, len: 19 })));
        assert_eq!(fixture.snapshot(), before);
        assert_eq!(fixture.index.text(), "First\nSecond\nThird\n");
    }

    #[test]
    fn malformed_insert_leaves_document_untouched() {
        let mut fixture = Fixture::new(three_paragraphs());
        let before = fixture.snapshot();
        let result = fixture.apply(vec![Op::retain(2), Op::embed(json!({"chapter": {}}))]);
        assert!(matches!(result, Err(Error::MalformedDelta { .. })));
        assert_eq!(fixture.snapshot(), before);
        assert_eq!(fixture.reconciler.ops.char_len(), 19);
    }

    #[test]
    fn retain_only_change_is_a_no_op() {
        let mut fixture = Fixture::new(three_paragraphs());
        let before = fixture.children();
        fixture.apply(vec![Op::retain(5)]).unwrap();
        assert_eq!(fixture.children(), before);
    }
}
