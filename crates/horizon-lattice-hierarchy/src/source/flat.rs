//! A data source for data that is already flat.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{HierarchicalDataSource, HierarchicalQuery};
use crate::count::ChildCount;
use crate::error::DataSourceError;

/// A single-level list exposed as a hierarchy whose items are all leaves.
///
/// Queries under any parent return nothing; root queries slice the list.
pub struct FlatDataSource<T, Id> {
    items: RwLock<Vec<T>>,
    id_fn: Arc<dyn Fn(&T) -> Id + Send + Sync>,
}

impl<T, Id> FlatDataSource<T, Id>
where
    T: Clone + Send + Sync + 'static,
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a source over `items`.
    pub fn new<F>(items: Vec<T>, id_fn: F) -> Self
    where
        F: Fn(&T) -> Id + Send + Sync + 'static,
    {
        Self {
            items: RwLock::new(items),
            id_fn: Arc::new(id_fn),
        }
    }

    /// Replace the whole list.
    pub fn set_items(&self, items: Vec<T>) {
        *self.items.write() = items;
    }

    /// Replace the item with the same id. Returns `false` if there is none.
    pub fn update(&self, item: T) -> bool {
        let id = (self.id_fn)(&item);
        let mut items = self.items.write();
        match items.iter_mut().find(|existing| (self.id_fn)(existing) == id) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns `true` if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T, Id> HierarchicalDataSource for FlatDataSource<T, Id>
where
    T: Clone + Send + Sync + 'static,
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Item = T;
    type Id = Id;

    fn id_of(&self, item: &T) -> Id {
        (self.id_fn)(item)
    }

    fn has_children(&self, _item: &T) -> bool {
        false
    }

    fn child_count(&self, query: &HierarchicalQuery<T>) -> Result<ChildCount, DataSourceError> {
        Ok(match query.parent {
            None => ChildCount::Known(self.items.read().len()),
            Some(_) => ChildCount::ZERO,
        })
    }

    fn fetch_children(&self, query: &HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> {
        if query.parent.is_some() {
            return Ok(Vec::new());
        }
        let items = self.items.read();
        let start = query.offset.min(items.len());
        let end = query.offset.saturating_add(query.limit).min(items.len());
        Ok(items[start..end].to_vec())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

impl<T, Id> Debug for FlatDataSource<T, Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatDataSource")
            .field("items", &self.items.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_source_is_single_level() {
        let source = FlatDataSource::new((0..100u32).collect(), |n: &u32| *n);
        assert_eq!(
            source.child_count(&HierarchicalQuery::count(None)).unwrap(),
            ChildCount::Known(100)
        );
        assert_eq!(
            source.child_count(&HierarchicalQuery::count(Some(5))).unwrap(),
            ChildCount::ZERO
        );
        assert_eq!(
            source.fetch_children(&HierarchicalQuery::new(None, 98, 10)).unwrap(),
            vec![98, 99]
        );
        assert!(!source.has_children(&5));
        assert!(source.is_in_memory());
    }

    #[test]
    fn test_update_replaces_in_place() {
        let source = FlatDataSource::new(vec![(1, "one"), (2, "two")], |item: &(i32, &'static str)| item.0);
        assert!(source.update((2, "deux")));
        assert!(!source.update((3, "three")));
        assert_eq!(
            source.fetch_children(&HierarchicalQuery::new(None, 0, 2)).unwrap(),
            vec![(1, "one"), (2, "deux")]
        );
    }
}
