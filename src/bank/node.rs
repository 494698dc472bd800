//! `AssetNode`: the asset-bank framework's central entity.
//!
//! Nodes live in a flat arena (`Vec<AssetNode>` indexed by [`NodeId`])
//! rather than behind `Rc`/`RefCell` pointers, matching the parent
//! crate's preference for index-based ownership over reference-counted
//! graphs (see `io::OutBuffer::Label`'s offset-based back-references).

use std::collections::HashMap;

use crate::error::{Error, Result};

use super::value::Value;

/// An index into a [`Tree`]'s arena. Cheap to copy, stable across
/// insertions (arena slots are never compacted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Number of presence-bitfield slots a node may use - matches
/// [`super::schema::Schema`]'s 32-attribute-per-type limit.
pub const MAX_ATTRIBUTES: usize = 32;

/// One asset node: a `(type, tag)` identity under a parent, a presence
/// bitfield plus typed attribute storage, an ordered child list, and the
/// precedence flags a [`super::forest::Forest`] reads.
#[derive(Debug, Clone)]
pub struct AssetNode {
    pub type_name: String,
    pub tag: String,
    pub parent: Option<NodeId>,
    /// Children, kept sorted by tag: children tags are unique within a
    /// parent, and are enumerated in tag order.
    children: Vec<NodeId>,
    /// Bit `i` set means `attributes[i]` is populated. Attributes that
    /// are absent are undefined, not zero.
    presence: u32,
    attributes: HashMap<usize, Value>,
    pub source_file: Option<String>,
    pub strongly_deleted: bool,
    pub weakly_deleted: bool,
    pub is_reference: bool,
}

impl AssetNode {
    fn new(type_name: impl Into<String>, tag: impl Into<String>, parent: Option<NodeId>) -> Self {
        AssetNode {
            type_name: type_name.into(),
            tag: tag.into(),
            parent,
            children: Vec::new(),
            presence: 0,
            attributes: HashMap::new(),
            source_file: None,
            strongly_deleted: false,
            weakly_deleted: false,
            is_reference: false,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_present(&self, index: usize) -> bool {
        self.presence & (1 << index) != 0
    }

    pub fn attribute(&self, index: usize) -> Option<&Value> {
        if self.is_present(index) {
            self.attributes.get(&index)
        } else {
            None
        }
    }

    fn set_attribute(&mut self, index: usize, value: Value) -> Result<()> {
        if index >= MAX_ATTRIBUTES {
            return Err(Error::SchemaViolation(format!(
                "attribute index {index} exceeds the {MAX_ATTRIBUTES}-slot presence bitfield"
            )));
        }
        self.presence |= 1 << index;
        self.attributes.insert(index, value);
        Ok(())
    }

    fn clear_attribute(&mut self, index: usize) {
        self.presence &= !(1 << index);
        self.attributes.remove(&index);
    }
}

/// An arena of [`AssetNode`]s forming one bank's tree, rooted at
/// [`Tree::root`]. Link computation (the `/`-separated absolute path) is
/// derived on demand by walking `parent` back-references rather than
/// cached on the node, since tags rarely change but caching would add a
/// second source of truth to invalidate.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<AssetNode>,
    root: NodeId,
}

impl Tree {
    /// Create a tree with a single root node of type `root_type`.
    pub fn new(root_type: impl Into<String>) -> Self {
        let root = AssetNode::new(root_type, "", None);
        Tree { nodes: vec![root], root: NodeId(0) }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &AssetNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut AssetNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Insert a new child under `parent`, keeping the child list sorted
    /// by tag. Errs if `tag` already names a child.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        type_name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<NodeId> {
        let tag = tag.into();
        if self.child_by_tag(parent, &tag).is_some() {
            return Err(Error::DuplicateChild(format!("{}/{tag}", self.link(parent))));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(AssetNode::new(type_name, tag.clone(), Some(parent)));
        let pos = {
            let siblings = &self.nodes[parent.0 as usize].children;
            siblings
                .binary_search_by(|&s| self.nodes[s.0 as usize].tag.as_str().cmp(tag.as_str()))
                .unwrap_or_else(|e| e)
        };
        self.nodes[parent.0 as usize].children.insert(pos, id);
        Ok(id)
    }

    pub fn child_by_tag(&self, parent: NodeId, tag: &str) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).tag == tag)
    }

    /// The `/`-separated absolute link from the root to `id`.
    pub fn link(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = self.node(c);
            if c != self.root {
                segments.push(node.tag.clone());
            }
            current = node.parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Resolve a `/`-separated link to a node, if present.
    pub fn resolve(&self, link: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in link.trim_start_matches('/').split('/').filter(|s| !s.is_empty()) {
            current = self.child_by_tag(current, segment)?;
        }
        Some(current)
    }

    pub fn set_attribute(&mut self, id: NodeId, index: usize, value: Value) -> Result<()> {
        self.node_mut(id).set_attribute(index, value)
    }

    pub fn clear_attribute(&mut self, id: NodeId, index: usize) {
        self.node_mut(id).clear_attribute(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_stay_sorted_by_tag() {
        let mut tree = Tree::new("World");
        tree.insert_child(tree.root(), "Area", "zeta").unwrap();
        tree.insert_child(tree.root(), "Area", "alpha").unwrap();
        tree.insert_child(tree.root(), "Area", "mid").unwrap();
        let tags: Vec<&str> = tree
            .node(tree.root())
            .children()
            .iter()
            .map(|&c| tree.node(c).tag.as_str())
            .collect();
        assert_eq!(tags, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut tree = Tree::new("World");
        tree.insert_child(tree.root(), "Area", "a").unwrap();
        assert!(tree.insert_child(tree.root(), "Area", "a").is_err());
    }

    #[test]
    fn link_is_slash_separated_from_root() {
        let mut tree = Tree::new("World");
        let area = tree.insert_child(tree.root(), "Area", "area0").unwrap();
        let moby = tree.insert_child(area, "Moby", "moby5").unwrap();
        assert_eq!(tree.link(moby), "/area0/moby5");
        assert_eq!(tree.resolve("/area0/moby5"), Some(moby));
    }

    #[test]
    fn attribute_presence_tracks_set_and_clear() {
        let mut tree = Tree::new("World");
        let area = tree.insert_child(tree.root(), "Area", "a").unwrap();
        assert!(!tree.node(area).is_present(0));
        tree.set_attribute(area, 0, Value::Float(1.0)).unwrap();
        assert!(tree.node(area).is_present(0));
        assert_eq!(tree.node(area).attribute(0), Some(&Value::Float(1.0)));
        tree.clear_attribute(area, 0);
        assert!(!tree.node(area).is_present(0));
    }

    #[test]
    fn attribute_index_beyond_bitfield_errs() {
        let mut tree = Tree::new("World");
        let area = tree.insert_child(tree.root(), "Area", "a").unwrap();
        assert!(tree.set_attribute(area, 32, Value::Int(1)).is_err());
    }
}
