//! Banks and forests: precedence-layered asset lookup.
//!
//! A [`Bank`] is one asset file collection (a root [`Tree`] plus game
//! tag/format version/build roots); a [`Forest`] stacks banks from
//! lowest to highest precedence. [`Forest::lookup`] implements the
//! precedence rules directly rather than as a lookup table, so the
//! resolution order is traceable in one function.

use std::collections::BTreeSet;

use crate::error::Result;

use super::node::{AssetNode, NodeId, Tree};
use super::value::Value;

/// One asset file collection: a tree plus its metadata (game tag, format
/// version, build roots).
#[derive(Debug)]
pub struct Bank {
    pub game_tag: String,
    pub format_version: u32,
    pub build_roots: Vec<String>,
    pub tree: Tree,
    /// The relative path new nodes are tagged with until the next
    /// [`Bank::switch_files`] call.
    current_file: String,
}

impl Bank {
    pub fn new(root_type: impl Into<String>, game_tag: impl Into<String>, format_version: u32) -> Self {
        Bank {
            game_tag: game_tag.into(),
            format_version,
            build_roots: Vec::new(),
            tree: Tree::new(root_type),
            current_file: "main".to_string(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Change the file-backing of subsequent mutations without altering
    /// the asset tree - used to split a bank into multiple files.
    pub fn switch_files(&mut self, relative_path: impl Into<String>) {
        self.current_file = relative_path.into();
    }

    /// Create (or return, if a conflicting child doesn't exist) a typed
    /// child, tagging it with the bank's current file.
    pub fn child(
        &mut self,
        parent: NodeId,
        type_name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<NodeId> {
        let id = self.tree.insert_child(parent, type_name, tag)?;
        self.tree.node_mut(id).source_file = Some(self.current_file.clone());
        Ok(id)
    }

    /// Write into this bank's copy of `id`'s attribute slot, creating
    /// the slot if necessary.
    pub fn set_attribute(&mut self, id: NodeId, index: usize, value: Value) -> Result<()> {
        self.tree.set_attribute(id, index, value)
    }
}

/// A precedence-ordered stack of banks, the first entry lowest
/// precedence, the last entry highest.
#[derive(Debug, Default)]
pub struct Forest {
    pub banks: Vec<Bank>,
}

impl Forest {
    pub fn new() -> Self {
        Forest::default()
    }

    pub fn push(&mut self, bank: Bank) {
        self.banks.push(bank);
    }

    /// Walk the precedence chain highest-to-lowest: a strongly-deleted
    /// node at any level stops the walk with `NotFound`; a weakly-deleted
    /// node is skipped without shadowing; the first live node found
    /// wins.
    pub fn lookup(&self, link: &str) -> Option<(usize, NodeId)> {
        for (i, bank) in self.banks.iter().enumerate().rev() {
            if let Some(id) = bank.tree.resolve(link) {
                let node = bank.tree.node(id);
                if node.strongly_deleted {
                    return None;
                }
                if node.weakly_deleted {
                    continue;
                }
                return Some((i, id));
            }
        }
        None
    }

    pub fn lookup_node(&self, link: &str) -> Option<&AssetNode> {
        self.lookup(link).map(|(i, id)| self.banks[i].tree.node(id))
    }

    /// Attribute-granular precedence lookup: starting
    /// from the highest bank that defines `link` at all, collect the
    /// attribute value from every bank further down the chain that also
    /// sets it, highest-precedence first. The resolved value is
    /// `chain.first()`; the rest is what makes additive mod attributes
    /// (e.g. arrays) possible.
    pub fn attribute_chain(&self, link: &str, index: usize) -> Vec<&Value> {
        let mut chain = Vec::new();
        for bank in self.banks.iter().rev() {
            let Some(id) = bank.tree.resolve(link) else {
                continue;
            };
            let node = bank.tree.node(id);
            if node.strongly_deleted {
                break;
            }
            if node.weakly_deleted {
                continue;
            }
            if let Some(value) = node.attribute(index) {
                chain.push(value);
            }
        }
        chain
    }

    pub fn attribute(&self, link: &str, index: usize) -> Option<&Value> {
        self.attribute_chain(link, index).into_iter().next()
    }

    /// Enumerate the tags of `parent_link`'s visible children whose
    /// resolved node has type `type_name`, after applying precedence and
    /// deletions.
    pub fn logical_children(&self, parent_link: &str, type_name: &str) -> Vec<String> {
        let mut all_tags: BTreeSet<String> = BTreeSet::new();
        for bank in &self.banks {
            if let Some(parent_id) = bank.tree.resolve(parent_link) {
                for &child in bank.tree.node(parent_id).children() {
                    all_tags.insert(bank.tree.node(child).tag.clone());
                }
            }
        }
        let base = parent_link.trim_end_matches('/');
        all_tags
            .into_iter()
            .filter(|tag| {
                let link = format!("{base}/{tag}");
                self.lookup_node(&link)
                    .is_some_and(|node| node.type_name == type_name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::value::Value;

    fn forest_with_moby(base_class: i64, mod_class: Option<i64>, strongly_deleted: bool, weakly_deleted: bool) -> Forest {
        let mut base = Bank::new("World", "rc2", 1);
        let moby_base = base.child(base.root(), "Moby", "42").unwrap();
        base.set_attribute(moby_base, 0, Value::Int(base_class)).unwrap();

        let mut forest = Forest::new();
        forest.push(base);

        let mut md = Bank::new("World", "rc2", 1);
        let moby_mod = md.child(md.root(), "Moby", "42").unwrap();
        if let Some(class) = mod_class {
            md.set_attribute(moby_mod, 0, Value::Int(class)).unwrap();
        }
        md.tree.node_mut(moby_mod).strongly_deleted = strongly_deleted;
        md.tree.node_mut(moby_mod).weakly_deleted = weakly_deleted;
        forest.push(md);
        forest
    }

    #[test]
    fn higher_precedence_bank_shadows_lower() {
        let forest = forest_with_moby(42, Some(99), false, false);
        let (bank, id) = forest.lookup("/42").unwrap();
        assert_eq!(bank, 1);
        assert_eq!(forest.banks[bank].tree.node(id).attribute(0), Some(&Value::Int(99)));
    }

    #[test]
    fn strongly_deleted_hides_lower_bank_entirely() {
        let forest = forest_with_moby(42, None, true, false);
        assert!(forest.lookup("/42").is_none());
    }

    #[test]
    fn weakly_deleted_falls_through_to_lower_bank() {
        let forest = forest_with_moby(42, None, false, true);
        let (bank, _) = forest.lookup("/42").unwrap();
        assert_eq!(bank, 0);
    }

    #[test]
    fn logical_children_merge_across_banks() {
        let mut base = Bank::new("World", "rc2", 1);
        base.child(base.root(), "Moby", "a").unwrap();
        let mut forest = Forest::new();
        forest.push(base);

        let mut md = Bank::new("World", "rc2", 1);
        md.child(md.root(), "Moby", "b").unwrap();
        forest.push(md);

        let mut children = forest.logical_children("/", "Moby");
        children.sort();
        assert_eq!(children, vec!["a", "b"]);
    }
}
