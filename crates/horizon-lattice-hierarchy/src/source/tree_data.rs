//! In-memory tree data source.
//!
//! `TreeDataSource` keeps a mutable tree behind a lock so the application can
//! edit it (add, remove, rename, move) while an engine is reading from it.
//! Edits are not pushed to the engine; call the engine's refresh operations
//! after editing.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{HierarchicalDataSource, HierarchicalQuery};
use crate::count::ChildCount;
use crate::error::DataSourceError;

/// A node in the tree structure.
struct TreeNode<T, Id> {
    data: T,
    children: Vec<Id>,
    parent: Option<Id>,
}

/// Internal storage for tree nodes.
struct TreeStorage<T, Id> {
    nodes: HashMap<Id, TreeNode<T, Id>>,
    root_children: Vec<Id>,
}

impl<T, Id: Clone + Eq + Hash> TreeStorage<T, Id> {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root_children: Vec::new(),
        }
    }

    fn children_of(&self, parent: Option<&Id>) -> Option<&[Id]> {
        match parent {
            None => Some(&self.root_children),
            Some(id) => self.nodes.get(id).map(|n| n.children.as_slice()),
        }
    }

    fn insert(&mut self, id: Id, data: T, parent: Option<Id>) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        match &parent {
            None => self.root_children.push(id.clone()),
            Some(pid) => match self.nodes.get_mut(pid) {
                Some(p) => p.children.push(id.clone()),
                None => return false,
            },
        }
        self.nodes.insert(
            id,
            TreeNode {
                data,
                children: Vec::new(),
                parent,
            },
        );
        true
    }

    fn detach(&mut self, id: &Id) {
        let parent = self.nodes.get(id).and_then(|n| n.parent.clone());
        match parent {
            Some(pid) => {
                if let Some(p) = self.nodes.get_mut(&pid) {
                    p.children.retain(|c| c != id);
                }
            }
            None => self.root_children.retain(|c| c != id),
        }
    }

    fn remove_subtree(&mut self, id: &Id) -> Option<T> {
        self.detach(id);
        let node = self.nodes.remove(id)?;
        let mut stack = node.children;
        while let Some(child) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                stack.extend(removed.children);
            }
        }
        Some(node.data)
    }

    fn is_ancestor(&self, ancestor: &Id, mut id: Id) -> bool {
        loop {
            if &id == ancestor {
                return true;
            }
            match self.nodes.get(&id).and_then(|n| n.parent.clone()) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }
}

type IdFn<T, Id> = Arc<dyn Fn(&T) -> Id + Send + Sync>;
type FilterFn<T> = Arc<dyn Fn(&T, &str) -> bool + Send + Sync>;

/// An editable in-memory hierarchy.
///
/// # Example
///
/// ```
/// use horizon_lattice_hierarchy::{HierarchicalDataSource, HierarchicalQuery, TreeDataSource};
///
/// let tree = TreeDataSource::new(|name: &String| name.clone());
/// tree.add_root("Documents".to_string());
/// tree.add_child(&"Documents".to_string(), "notes.txt".to_string());
///
/// let query = HierarchicalQuery::new(Some("Documents".to_string()), 0, 10);
/// assert_eq!(tree.fetch_children(&query).unwrap(), vec!["notes.txt".to_string()]);
/// ```
pub struct TreeDataSource<T, Id> {
    storage: RwLock<TreeStorage<T, Id>>,
    id_fn: IdFn<T, Id>,
    filter_fn: Option<FilterFn<T>>,
}

impl<T, Id> TreeDataSource<T, Id>
where
    T: Clone + Send + Sync + 'static,
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create an empty tree that identifies items with `id_fn`.
    pub fn new<F>(id_fn: F) -> Self
    where
        F: Fn(&T) -> Id + Send + Sync + 'static,
    {
        Self {
            storage: RwLock::new(TreeStorage::new()),
            id_fn: Arc::new(id_fn),
            filter_fn: None,
        }
    }

    /// Install a predicate applied to every level when a query carries a filter.
    pub fn with_filter<F>(mut self, filter_fn: F) -> Self
    where
        F: Fn(&T, &str) -> bool + Send + Sync + 'static,
    {
        self.filter_fn = Some(Arc::new(filter_fn));
        self
    }

    /// Add a root-level item. Returns `None` if its id is already present.
    pub fn add_root(&self, item: T) -> Option<Id> {
        let id = (self.id_fn)(&item);
        self.storage
            .write()
            .insert(id.clone(), item, None)
            .then_some(id)
    }

    /// Add a child under `parent`. Returns `None` if the parent is missing or the id is taken.
    pub fn add_child(&self, parent: &Id, item: T) -> Option<Id> {
        let id = (self.id_fn)(&item);
        self.storage
            .write()
            .insert(id.clone(), item, Some(parent.clone()))
            .then_some(id)
    }

    /// Remove an item and its whole subtree, returning the item.
    pub fn remove(&self, id: &Id) -> Option<T> {
        self.storage.write().remove_subtree(id)
    }

    /// Replace the payload of an existing item, keeping its position.
    ///
    /// Returns `false` if no item has the same id.
    pub fn update(&self, item: T) -> bool {
        let id = (self.id_fn)(&item);
        match self.storage.write().nodes.get_mut(&id) {
            Some(node) => {
                node.data = item;
                true
            }
            None => false,
        }
    }

    /// Move an item (with its subtree) to the end of `new_parent`'s children.
    ///
    /// Returns `false` if either item is missing or the move would create a cycle.
    pub fn move_to(&self, id: &Id, new_parent: Option<&Id>) -> bool {
        let mut storage = self.storage.write();
        if !storage.nodes.contains_key(id) {
            return false;
        }
        if let Some(parent) = new_parent {
            if !storage.nodes.contains_key(parent) || storage.is_ancestor(id, parent.clone()) {
                return false;
            }
        }
        storage.detach(id);
        match new_parent {
            Some(parent) => {
                if let Some(p) = storage.nodes.get_mut(parent) {
                    p.children.push(id.clone());
                }
            }
            None => storage.root_children.push(id.clone()),
        }
        if let Some(node) = storage.nodes.get_mut(id) {
            node.parent = new_parent.cloned();
        }
        true
    }

    /// Remove every item.
    pub fn clear(&self) {
        let mut storage = self.storage.write();
        storage.nodes.clear();
        storage.root_children.clear();
    }

    /// Returns a clone of the item with `id`.
    pub fn get(&self, id: &Id) -> Option<T> {
        self.storage.read().nodes.get(id).map(|n| n.data.clone())
    }

    /// Returns `true` if an item with `id` exists.
    pub fn contains(&self, id: &Id) -> bool {
        self.storage.read().nodes.contains_key(id)
    }

    /// Returns the parent id of `id`, `None` for root items and unknown ids.
    pub fn parent_of(&self, id: &Id) -> Option<Id> {
        self.storage.read().nodes.get(id).and_then(|n| n.parent.clone())
    }

    /// Total number of items at every level.
    pub fn len(&self) -> usize {
        self.storage.read().nodes.len()
    }

    /// Returns `true` if the tree has no items.
    pub fn is_empty(&self) -> bool {
        self.storage.read().nodes.is_empty()
    }

    fn visible_children(&self, query: &HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> {
        let storage = self.storage.read();
        let parent_id = query.parent.as_ref().map(|p| (self.id_fn)(p));
        let children = storage
            .children_of(parent_id.as_ref())
            .ok_or(DataSourceError::ParentNotFound)?;
        let filter = match (&self.filter_fn, &query.filter) {
            (Some(f), Some(text)) => Some((f, text)),
            _ => None,
        };
        Ok(children
            .iter()
            .filter_map(|id| storage.nodes.get(id))
            .filter(|node| filter.is_none_or(|(f, text)| f(&node.data, text.as_ref())))
            .map(|node| node.data.clone())
            .collect())
    }
}

impl<T, Id> HierarchicalDataSource for TreeDataSource<T, Id>
where
    T: Clone + Send + Sync + 'static,
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Item = T;
    type Id = Id;

    fn id_of(&self, item: &T) -> Id {
        (self.id_fn)(item)
    }

    fn has_children(&self, item: &T) -> bool {
        let id = (self.id_fn)(item);
        self.storage
            .read()
            .nodes
            .get(&id)
            .is_some_and(|n| !n.children.is_empty())
    }

    fn child_count(&self, query: &HierarchicalQuery<T>) -> Result<ChildCount, DataSourceError> {
        if query.filter.is_none() || self.filter_fn.is_none() {
            let storage = self.storage.read();
            let parent_id = query.parent.as_ref().map(|p| (self.id_fn)(p));
            return storage
                .children_of(parent_id.as_ref())
                .map(|c| ChildCount::Known(c.len()))
                .ok_or(DataSourceError::ParentNotFound);
        }
        Ok(ChildCount::Known(self.visible_children(query)?.len()))
    }

    fn fetch_children(&self, query: &HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> {
        Ok(self
            .visible_children(query)?
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

impl<T, Id> std::fmt::Debug for TreeDataSource<T, Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = self.storage.read();
        f.debug_struct("TreeDataSource")
            .field("items", &storage.nodes.len())
            .field("roots", &storage.root_children.len())
            .finish()
    }
}
