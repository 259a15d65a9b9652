//! Arena-backed scripture node tree.
//!
//! The tree owns every node in a slot vector. Parents list their children by
//! [`NodeId`]; children keep a plain id back to their parent. Nodes enter the
//! tree as [`DetachedNode`] values and leave it the same way, so a subtree is
//! never reachable from two places.

mod node;

use tower_lsp::lsp_types::{Position, Range};

pub use node::{Attributes, CellAlign, DetachedNode, NodeType, ScriptureNode, EMBED_PLACEHOLDER};

/// Handle to a node inside a [`ScriptureTree`].
///
/// Ids are stable for as long as the node stays attached. Slots of removed
/// nodes are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone)]
struct NodeData {
    node: ScriptureNode,
    range: Range,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ScriptureTree {
    slots: Vec<Option<NodeData>>,
    free: Vec<NodeId>,
    root: NodeId,
}

impl Default for ScriptureTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptureTree {
    /// Create a tree holding an empty `Document` root.
    pub fn new() -> Self {
        Self {
            slots: vec![Some(NodeData {
                node: ScriptureNode::Document,
                range: Range::default(),
                parent: None,
                children: Vec::new(),
            })],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Borrowed view of a node, or `None` if the id is not attached.
    pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.contains(id).then_some(NodeRef { tree: self, id })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.0 as usize), Some(Some(_)))
    }

    fn data(&self, id: NodeId) -> &NodeData {
        match self.slots.get(id.0 as usize) {
            Some(Some(data)) => data,
            _ => panic!("{id:?} is not attached to this tree"),
        }
    }

    fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(data)) => data,
            _ => panic!("{id:?} is not attached to this tree"),
        }
    }

    pub fn node(&self, id: NodeId) -> &ScriptureNode {
        &self.data(id).node
    }

    pub fn range(&self, id: NodeId) -> Range {
        self.data(id).range
    }

    pub fn set_range(&mut self, id: NodeId, range: Range) {
        self.data_mut(id).range = range;
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.data(id).children
    }

    /// Position of `id` among its parent's children.
    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&child| child == id)
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let index = self.index_in_parent(id)?;
        index
            .checked_sub(1)
            .map(|previous| self.children(parent)[previous])
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let index = self.index_in_parent(id)?;
        self.children(parent).get(index + 1).copied()
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = Some(data);
                id
            }
            None => {
                let id = NodeId(self.slots.len() as u32);
                self.slots.push(Some(data));
                id
            }
        }
    }

    /// Move a detached subtree into the arena under `parent`, without linking
    /// it into the parent's child list.
    fn attach(&mut self, parent: NodeId, detached: DetachedNode) -> NodeId {
        let DetachedNode {
            node,
            range,
            children,
        } = detached;
        let id = self.alloc(NodeData {
            node,
            range,
            parent: Some(parent),
            children: Vec::with_capacity(children.len()),
        });
        for child in children {
            let child_id = self.attach(id, child);
            self.data_mut(id).children.push(child_id);
        }
        id
    }

    /// Take a subtree out of the arena, freeing its slots.
    fn detach(&mut self, id: NodeId) -> DetachedNode {
        let data = match self.slots.get_mut(id.0 as usize).and_then(Option::take) {
            Some(data) => data,
            None => panic!("{id:?} is not attached to this tree"),
        };
        self.free.push(id);
        let children = data
            .children
            .into_iter()
            .map(|child| self.detach(child))
            .collect();
        DetachedNode {
            node: data.node,
            range: data.range,
            children,
        }
    }

    fn assert_container(&self, parent: NodeId) {
        let node = self.node(parent);
        assert!(
            node.is_container(),
            "{:?} is a leaf and cannot own children",
            node.node_type()
        );
    }

    pub fn append_child(&mut self, parent: NodeId, node: DetachedNode) -> NodeId {
        let index = self.children(parent).len();
        self.insert_child(parent, index, node)
    }

    /// # Panics
    ///
    /// Panics if `parent` is a leaf or `index` is past the end of its children.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, node: DetachedNode) -> NodeId {
        self.assert_container(parent);
        let len = self.children(parent).len();
        assert!(index <= len, "insert index {index} out of bounds ({len} children)");
        let id = self.attach(parent, node);
        self.data_mut(parent).children.insert(index, id);
        id
    }

    /// Detach `child` from `parent` and hand the subtree back.
    ///
    /// # Panics
    ///
    /// Panics if `child` is not a child of `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> DetachedNode {
        assert_eq!(
            self.parent(child),
            Some(parent),
            "{child:?} is not a child of {parent:?}"
        );
        let Some(index) = self.children(parent).iter().position(|&c| c == child) else {
            panic!("{child:?} is missing from the children of {parent:?}");
        };
        self.data_mut(parent).children.remove(index);
        self.detach(child)
    }

    /// Detach a node from its parent.
    ///
    /// # Panics
    ///
    /// Panics if the node has no parent (the root).
    pub fn remove(&mut self, id: NodeId) -> DetachedNode {
        let Some(parent) = self.parent(id) else {
            panic!("{id:?} has no parent");
        };
        self.remove_child(parent, id)
    }

    /// Replace `delete_count` children of `parent` starting at `start` with
    /// `nodes`, returning the removed subtrees.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is a leaf or the window is out of bounds. Nothing is
    /// changed in that case.
    pub fn splice_children(
        &mut self,
        parent: NodeId,
        start: usize,
        delete_count: usize,
        nodes: Vec<DetachedNode>,
    ) -> Vec<DetachedNode> {
        self.assert_container(parent);
        let len = self.children(parent).len();
        assert!(
            start <= len && delete_count <= len - start,
            "splice window {start}..{} out of bounds ({len} children)",
            start + delete_count
        );
        let inserted: Vec<NodeId> = nodes
            .into_iter()
            .map(|node| self.attach(parent, node))
            .collect();
        let removed: Vec<NodeId> = self
            .data_mut(parent)
            .children
            .splice(start..start + delete_count, inserted)
            .collect();
        removed.into_iter().map(|id| self.detach(id)).collect()
    }

    /// Rewrite every position in the subtree rooted at `id`.
    pub(crate) fn map_positions(&mut self, id: NodeId, map: &impl Fn(Position) -> Position) {
        let data = self.data_mut(id);
        data.range = Range::new(map(data.range.start), map(data.range.end));
        let children = data.children.clone();
        for child in children {
            self.map_positions(child, map);
        }
    }

    /// Depth-first, pre-order traversal of the descendants of `id`.
    pub fn nodes(&self, id: NodeId) -> Descendants<'_> {
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        stack.reverse();
        Descendants { tree: self, stack }
    }

    /// Descendants of `id` with the given type, in document order.
    pub fn find_nodes(&self, id: NodeId, node_type: NodeType) -> impl Iterator<Item = NodeRef<'_>> {
        self.nodes(id)
            .filter(move |node| node.node_type() == node_type)
    }

    /// Leaf text of the subtree rooted at `id`, in document order.
    pub fn get_text(&self, id: NodeId) -> String {
        let mut text = String::new();
        self.collect_text(id, &mut text);
        text
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let data = self.data(id);
        if let Some(text) = data.node.leaf_text() {
            out.push_str(&text);
        }
        for &child in &data.children {
            self.collect_text(child, out);
        }
    }

    /// Owned copy of the subtree rooted at `id`.
    pub fn to_detached(&self, id: NodeId) -> DetachedNode {
        let data = self.data(id);
        DetachedNode {
            node: data.node.clone(),
            range: data.range,
            children: data
                .children
                .iter()
                .map(|&child| self.to_detached(child))
                .collect(),
        }
    }
}

/// Borrowed view of one attached node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a ScriptureTree,
    id: NodeId,
}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("node", self.node())
            .field("range", &self.range())
            .finish()
    }
}

impl<'a> NodeRef<'a> {
    pub fn id(self) -> NodeId {
        self.id
    }

    pub fn node(self) -> &'a ScriptureNode {
        self.tree.node(self.id)
    }

    pub fn node_type(self) -> NodeType {
        self.node().node_type()
    }

    pub fn range(self) -> Range {
        self.tree.range(self.id)
    }

    pub fn parent(self) -> Option<NodeRef<'a>> {
        self.tree.parent(self.id).map(|id| self.with(id))
    }

    pub fn children(self) -> impl Iterator<Item = NodeRef<'a>> {
        let tree = self.tree;
        tree.children(self.id)
            .iter()
            .map(move |&id| NodeRef { tree, id })
    }

    pub fn previous(self) -> Option<NodeRef<'a>> {
        self.tree.previous_sibling(self.id).map(|id| self.with(id))
    }

    pub fn next(self) -> Option<NodeRef<'a>> {
        self.tree.next_sibling(self.id).map(|id| self.with(id))
    }

    pub fn text(self) -> String {
        self.tree.get_text(self.id)
    }

    pub fn descendants(self) -> Descendants<'a> {
        self.tree.nodes(self.id)
    }

    fn with(self, id: NodeId) -> NodeRef<'a> {
        NodeRef {
            tree: self.tree,
            id,
        }
    }
}

/// Lazy pre-order iterator over a subtree. Each call to
/// [`ScriptureTree::nodes`] starts a fresh traversal.
pub struct Descendants<'a> {
    tree: &'a ScriptureTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.children(id).iter().rev().copied());
        Some(NodeRef {
            tree: self.tree,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: (u32, u32), end: (u32, u32)) -> Range {
        Range::new(Position::new(start.0, start.1), Position::new(end.0, end.1))
    }

    fn paragraph(text: &str, line: u32) -> DetachedNode {
        DetachedNode::with_children(
            ScriptureNode::Paragraph {
                style: "p".to_string(),
                attrs: Attributes::new(),
            },
            range((line, 0), (line + 1, 0)),
            vec![DetachedNode::text(text, range((line, 0), (line, text.len() as u32)))],
        )
    }

    #[test]
    fn append_sets_parent() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let p = tree.append_child(root, paragraph("hello", 0));
        assert_eq!(tree.parent(p), Some(root));
        let text = tree.children(p)[0];
        assert_eq!(tree.parent(text), Some(p));
        assert_eq!(tree.get_text(root), "hello");
    }

    #[test]
    fn insert_and_siblings() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let a = tree.append_child(root, paragraph("a", 0));
        let c = tree.append_child(root, paragraph("c", 2));
        let b = tree.insert_child(root, 1, paragraph("b", 1));
        assert_eq!(tree.children(root), &[a, b, c]);
        assert_eq!(tree.previous_sibling(b), Some(a));
        assert_eq!(tree.next_sibling(b), Some(c));
        assert_eq!(tree.previous_sibling(a), None);
        assert_eq!(tree.next_sibling(c), None);
    }

    #[test]
    fn remove_returns_subtree() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let a = tree.append_child(root, paragraph("a", 0));
        let removed = tree.remove(a);
        assert_eq!(removed, paragraph("a", 0));
        assert!(!tree.contains(a));
        assert!(tree.children(root).is_empty());
    }

    #[test]
    #[should_panic(expected = "is not a child of")]
    fn remove_child_from_wrong_parent() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let a = tree.append_child(root, paragraph("a", 0));
        let b = tree.append_child(root, paragraph("b", 1));
        let text = tree.children(a)[0];
        tree.remove_child(b, text);
    }

    #[test]
    #[should_panic(expected = "has no parent")]
    fn remove_root() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.remove(root);
    }

    #[test]
    #[should_panic(expected = "cannot own children")]
    fn leaf_cannot_own_children() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let p = tree.append_child(root, paragraph("a", 0));
        let text = tree.children(p)[0];
        tree.append_child(text, DetachedNode::text("x", Range::default()));
    }

    #[test]
    fn splice_replaces_window() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        let a = tree.append_child(root, paragraph("a", 0));
        tree.append_child(root, paragraph("b", 1));
        let c = tree.append_child(root, paragraph("c", 2));

        let removed = tree.splice_children(root, 1, 1, vec![paragraph("x", 1), paragraph("y", 2)]);
        assert_eq!(removed, vec![paragraph("b", 1)]);
        let children = tree.children(root);
        assert_eq!(children.len(), 4);
        assert_eq!(children[0], a);
        assert_eq!(children[3], c);
        assert_eq!(tree.get_text(root), "axyc");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn splice_out_of_bounds() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.append_child(root, paragraph("a", 0));
        tree.splice_children(root, 1, 2, Vec::new());
    }

    #[test]
    fn traversal_is_preorder_and_restartable() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.append_child(root, paragraph("a", 0));
        tree.append_child(root, paragraph("b", 1));

        let types: Vec<NodeType> = tree.nodes(root).map(NodeRef::node_type).collect();
        assert_eq!(
            types,
            vec![
                NodeType::Paragraph,
                NodeType::Text,
                NodeType::Paragraph,
                NodeType::Text
            ]
        );
        assert_eq!(tree.find_nodes(root, NodeType::Text).count(), 2);
        assert_eq!(tree.find_nodes(root, NodeType::Text).count(), 2);
    }

    #[test]
    fn marker_leaves_render_placeholder() {
        let mut tree = ScriptureTree::new();
        let root = tree.root();
        tree.append_child(
            root,
            DetachedNode::new(
                ScriptureNode::Verse {
                    number: "1".to_string(),
                    alt_number: None,
                    pub_number: None,
                },
                range((0, 0), (0, 1)),
            ),
        );
        tree.append_child(root, DetachedNode::text("In", range((0, 1), (0, 3))));
        assert_eq!(tree.get_text(root), format!("{EMBED_PLACEHOLDER}In"));
    }
}
