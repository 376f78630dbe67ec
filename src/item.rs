//! Playlist items and the two parallel tree views over them.
//!
//! The store owns every item and exposes a hierarchical category tree plus a
//! flattened one-level tree. Both trees reference the same leaf entries by id;
//! leaves are never copied between views.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use thiserror::Error;

/// Process-lifetime-unique item identifier. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

impl ItemId {
    fn allocate() -> Self {
        ItemId(NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Item state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFlags {
    /// The item cannot be removed by callers.
    pub read_only: bool,
    /// Removal was requested while the item was in use; deletion is deferred
    /// until the scheduler moves off it.
    pub pending_removal: bool,
}

/// One playable unit (leaf) or a container node in the playlist trees.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    /// Media URI for leaves, display name for nodes.
    pub uri: String,
    pub flags: ItemFlags,
    /// Back-reference to the containing node, absent for the roots.
    pub parent: Option<ItemId>,
    is_node: bool,
    children: Vec<ItemId>,
}

impl Item {
    pub fn is_node(&self) -> bool {
        self.is_node
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_node
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }
}

/// Descriptor handed to the worker factory when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub id: ItemId,
    pub uri: String,
}

/// Item store lookup/mutation failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("no item with id {0}")]
    NotFound(u64),
    #[error("item {0} is not a container node")]
    NotANode(u64),
    #[error("item {0} is read-only")]
    ReadOnly(u64),
}

/// Owns all items and the category / one-level views over them.
pub struct ItemStore {
    items: HashMap<ItemId, Item>,
    root_category: ItemId,
    root_onelevel: ItemId,
}

impl ItemStore {
    pub fn new() -> Self {
        let mut items = HashMap::new();
        let root_category = Self::insert_root(&mut items, "category");
        let root_onelevel = Self::insert_root(&mut items, "onelevel");
        Self {
            items,
            root_category,
            root_onelevel,
        }
    }

    fn insert_root(items: &mut HashMap<ItemId, Item>, name: &str) -> ItemId {
        let id = ItemId::allocate();
        items.insert(
            id,
            Item {
                id,
                uri: name.to_string(),
                flags: ItemFlags {
                    read_only: true,
                    pending_removal: false,
                },
                parent: None,
                is_node: true,
                children: Vec::new(),
            },
        );
        id
    }

    /// Root of the hierarchical category view.
    pub fn root_category(&self) -> ItemId {
        self.root_category
    }

    /// Root of the flattened one-level view.
    pub fn root_onelevel(&self) -> ItemId {
        self.root_onelevel
    }

    pub fn lookup(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    /// Ordered children of a container node.
    pub fn children(&self, node: ItemId) -> Result<&[ItemId], StoreError> {
        let item = self.items.get(&node).ok_or(StoreError::NotFound(node.0))?;
        if !item.is_node {
            return Err(StoreError::NotANode(node.0));
        }
        Ok(&item.children)
    }

    /// Creates a container node under `parent` in the category tree.
    pub fn create_node(&mut self, parent: ItemId, name: &str) -> Result<ItemId, StoreError> {
        self.require_node(parent)?;
        let id = ItemId::allocate();
        self.items.insert(
            id,
            Item {
                id,
                uri: name.to_string(),
                flags: ItemFlags::default(),
                parent: Some(parent),
                is_node: true,
                children: Vec::new(),
            },
        );
        self.items
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(id);
        Ok(id)
    }

    /// Adds a playable leaf under `parent` in the category tree and appends it
    /// to the one-level root, so both views reference the same entry.
    pub fn add_leaf(&mut self, parent: ItemId, uri: &str) -> Result<ItemId, StoreError> {
        self.require_node(parent)?;
        let id = ItemId::allocate();
        self.items.insert(
            id,
            Item {
                id,
                uri: uri.to_string(),
                flags: ItemFlags::default(),
                parent: Some(parent),
                is_node: false,
                children: Vec::new(),
            },
        );
        self.items
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(id);
        if parent != self.root_onelevel {
            self.items
                .get_mut(&self.root_onelevel)
                .expect("one-level root always exists")
                .children
                .push(id);
        }
        debug!("added leaf. id={} uri={}", id.raw(), uri);
        Ok(id)
    }

    fn require_node(&self, id: ItemId) -> Result<(), StoreError> {
        let item = self.items.get(&id).ok_or(StoreError::NotFound(id.0))?;
        if !item.is_node {
            return Err(StoreError::NotANode(id.0));
        }
        Ok(())
    }

    /// Removes an item (and, for nodes, its whole subtree) from both views.
    ///
    /// Entries listed in `in_use` are unlinked from the trees but kept in the
    /// flat set with `pending_removal` raised; they are dropped by
    /// [`ItemStore::purge_pending`] once no longer referenced.
    pub fn remove(&mut self, id: ItemId, in_use: &[ItemId]) -> Result<(), StoreError> {
        let item = self.items.get(&id).ok_or(StoreError::NotFound(id.0))?;
        if item.flags.read_only {
            return Err(StoreError::ReadOnly(id.0));
        }
        let parent = item.parent;

        let mut subtree = Vec::new();
        self.collect_subtree(id, &mut subtree);

        if let Some(parent) = parent {
            if let Some(parent_item) = self.items.get_mut(&parent) {
                parent_item.children.retain(|&child| child != id);
            }
        }
        let leaf_ids: Vec<ItemId> = subtree
            .iter()
            .copied()
            .filter(|sub| self.items.get(sub).is_some_and(|i| i.is_leaf()))
            .collect();
        if let Some(onelevel) = self.items.get_mut(&self.root_onelevel) {
            onelevel
                .children
                .retain(|child| !leaf_ids.contains(child));
        }

        for sub in subtree {
            if in_use.contains(&sub) {
                if let Some(kept) = self.items.get_mut(&sub) {
                    kept.flags.pending_removal = true;
                    debug!("deferred removal of in-use item. id={}", sub.raw());
                }
            } else {
                self.items.remove(&sub);
            }
        }
        Ok(())
    }

    fn collect_subtree(&self, id: ItemId, out: &mut Vec<ItemId>) {
        out.push(id);
        if let Some(item) = self.items.get(&id) {
            for &child in &item.children {
                self.collect_subtree(child, out);
            }
        }
    }

    /// Drops deferred-removal entries that are no longer in use.
    pub fn purge_pending(&mut self, in_use: &[ItemId]) {
        self.items
            .retain(|id, item| !item.flags.pending_removal || in_use.contains(id));
    }

    /// Depth-first enumeration of playable leaves under `node`, in tree order.
    pub fn leaves_under(&self, node: ItemId) -> Vec<ItemId> {
        let mut leaves = Vec::new();
        self.collect_leaves(node, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, id: ItemId, out: &mut Vec<ItemId>) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if item.is_leaf() {
            out.push(id);
            return;
        }
        for &child in &item.children {
            self.collect_leaves(child, out);
        }
    }

    /// First playable leaf under `node` in tree order.
    pub fn first_leaf(&self, node: ItemId) -> Option<ItemId> {
        self.leaves_under(node).first().copied()
    }

    /// Tree-order successor of `current` among the leaves under `node`.
    pub fn next_leaf_after(&self, node: ItemId, current: ItemId) -> Option<ItemId> {
        let leaves = self.leaves_under(node);
        let position = leaves.iter().position(|&leaf| leaf == current)?;
        leaves.get(position + 1).copied()
    }

    /// Descriptor for starting a session on `id`.
    pub fn descriptor(&self, id: ItemId) -> Option<ItemDescriptor> {
        self.items.get(&id).map(|item| ItemDescriptor {
            id,
            uri: item.uri.clone(),
        })
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut store = ItemStore::new();
        let root = store.root_category();
        let a = store.add_leaf(root, "a.flac").unwrap();
        let b = store.add_leaf(root, "b.flac").unwrap();
        assert!(b > a);
        let mut other = ItemStore::new();
        let c = other.add_leaf(other.root_category(), "c.flac").unwrap();
        assert!(c > b, "ids must be unique across stores in one process");
    }

    #[test]
    fn leaf_is_visible_in_both_views() {
        let mut store = ItemStore::new();
        let node = store.create_node(store.root_category(), "album").unwrap();
        let leaf = store.add_leaf(node, "track.flac").unwrap();

        assert_eq!(store.children(node).unwrap(), &[leaf]);
        assert_eq!(store.children(store.root_onelevel()).unwrap(), &[leaf]);
        // Same entry, not a copy.
        assert_eq!(store.lookup(leaf).unwrap().uri, "track.flac");
        assert_eq!(store.item_count(), 4);
    }

    #[test]
    fn leaves_keep_insertion_order() {
        let mut store = ItemStore::new();
        let root = store.root_category();
        let album = store.create_node(root, "album").unwrap();
        let a = store.add_leaf(root, "a").unwrap();
        let b = store.add_leaf(album, "b").unwrap();
        let c = store.add_leaf(root, "c").unwrap();

        // Category view flattens depth-first; one-level view keeps append order.
        assert_eq!(store.leaves_under(root), vec![b, a, c]);
        assert_eq!(store.leaves_under(store.root_onelevel()), vec![a, b, c]);
    }

    #[test]
    fn next_leaf_walks_tree_order() {
        let mut store = ItemStore::new();
        let root = store.root_onelevel();
        let a = store.add_leaf(root, "a").unwrap();
        let b = store.add_leaf(root, "b").unwrap();
        assert_eq!(store.first_leaf(root), Some(a));
        assert_eq!(store.next_leaf_after(root, a), Some(b));
        assert_eq!(store.next_leaf_after(root, b), None);
    }

    #[test]
    fn remove_unlinks_from_both_views() {
        let mut store = ItemStore::new();
        let node = store.create_node(store.root_category(), "album").unwrap();
        let leaf = store.add_leaf(node, "track").unwrap();

        store.remove(leaf, &[]).unwrap();
        assert!(store.lookup(leaf).is_none());
        assert!(store.children(node).unwrap().is_empty());
        assert!(store.children(store.root_onelevel()).unwrap().is_empty());
    }

    #[test]
    fn remove_node_removes_subtree() {
        let mut store = ItemStore::new();
        let node = store.create_node(store.root_category(), "album").unwrap();
        let a = store.add_leaf(node, "a").unwrap();
        let b = store.add_leaf(node, "b").unwrap();

        store.remove(node, &[]).unwrap();
        assert!(store.lookup(node).is_none());
        assert!(store.lookup(a).is_none());
        assert!(store.lookup(b).is_none());
        assert!(store.children(store.root_onelevel()).unwrap().is_empty());
    }

    #[test]
    fn roots_are_read_only() {
        let mut store = ItemStore::new();
        let root = store.root_category();
        assert_eq!(
            store.remove(root, &[]),
            Err(StoreError::ReadOnly(root.raw()))
        );
    }

    #[test]
    fn in_use_item_removal_is_deferred() {
        let mut store = ItemStore::new();
        let root = store.root_onelevel();
        let leaf = store.add_leaf(root, "playing").unwrap();

        store.remove(leaf, &[leaf]).unwrap();
        // Unlinked from the trees but still resolvable while in use.
        assert!(store.children(root).unwrap().is_empty());
        let kept = store.lookup(leaf).expect("in-use item must survive removal");
        assert!(kept.flags.pending_removal);

        store.purge_pending(&[leaf]);
        assert!(store.lookup(leaf).is_some());
        store.purge_pending(&[]);
        assert!(store.lookup(leaf).is_none());
    }
}
