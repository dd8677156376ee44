//! The hierarchical data source contract and its stock implementations.
//!
//! The engine never owns data. It asks a [`HierarchicalDataSource`] for child
//! counts and bounded windows of children, and identifies items only through
//! [`HierarchicalDataSource::id_of`].
//!
//! Three strategies ship with the crate:
//!
//! - [`TreeDataSource`]: an in-memory tree that can be edited while the engine is live
//! - [`CallbackDataSource`]: a lazy backend described by closures, possibly with unknown counts
//! - [`FlatDataSource`]: an already-flat list, every item a leaf

mod callback;
mod flat;
mod tree_data;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

pub use callback::CallbackDataSource;
pub use flat::FlatDataSource;
pub use tree_data::TreeDataSource;

use crate::count::ChildCount;
use crate::error::DataSourceError;

/// A request for a window of children under one parent.
///
/// `offset`/`limit` describe a strict sub-window, not a cursor: a source must
/// be able to serve any window in any order.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchicalQuery<T> {
    /// The parent item, `None` for the root level.
    pub parent: Option<T>,
    /// Index of the first child to return.
    pub offset: usize,
    /// Maximum number of children to return.
    pub limit: usize,
    /// Opaque filter text forwarded from the engine.
    pub filter: Option<Arc<str>>,
}

impl<T> HierarchicalQuery<T> {
    /// Create a query for `[offset, offset + limit)` under `parent`.
    pub fn new(parent: Option<T>, offset: usize, limit: usize) -> Self {
        Self {
            parent,
            offset,
            limit,
            filter: None,
        }
    }

    /// Create a count-only query (empty window) under `parent`.
    pub fn count(parent: Option<T>) -> Self {
        Self::new(parent, 0, 0)
    }

    /// Attach a filter.
    pub fn with_filter(mut self, filter: Option<Arc<str>>) -> Self {
        self.filter = filter;
        self
    }

    /// The requested range of child indices.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset.saturating_add(self.limit)
    }
}

/// A supplier of hierarchical data.
///
/// Implementations may be in memory or backed by a remote service; calls may
/// block. `fetch_children` is only ever called with bounded windows.
///
/// Identities must be total and collision free: two items are the same row
/// exactly when their ids compare equal. When raw ids repeat at different
/// positions, wrap them in a [`QualifiedId`].
pub trait HierarchicalDataSource: Send + Sync + 'static {
    /// The application value.
    type Item: Clone + Send + Sync + 'static;
    /// The identity of an item.
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Returns the identity of `item`.
    fn id_of(&self, item: &Self::Item) -> Self::Id;

    /// Returns `true` if `item` may have children.
    fn has_children(&self, item: &Self::Item) -> bool;

    /// Returns the number of children under `query.parent`.
    fn child_count(
        &self,
        query: &HierarchicalQuery<Self::Item>,
    ) -> Result<ChildCount, DataSourceError>;

    /// Returns the children in `query.range()`, in source order.
    ///
    /// Returning fewer than `limit` items means the parent has no children
    /// past the returned ones.
    fn fetch_children(
        &self,
        query: &HierarchicalQuery<Self::Item>,
    ) -> Result<Vec<Self::Item>, DataSourceError>;

    /// Hint that the whole hierarchy lives in memory and can be fetched eagerly.
    fn is_in_memory(&self) -> bool {
        false
    }
}

/// A path-qualified identity: the ids of every ancestor followed by the item's own id.
///
/// Use this when ids are only unique among siblings, e.g. file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedId<Id>(Vec<Id>);

impl<Id: Clone> QualifiedId<Id> {
    /// A root-level identity.
    pub fn root(id: Id) -> Self {
        Self(vec![id])
    }

    /// The identity of a child of `self`.
    pub fn child(&self, id: Id) -> Self {
        let mut path = self.0.clone();
        path.push(id);
        Self(path)
    }

    /// The identity of the parent, `None` at the root level.
    pub fn parent(&self) -> Option<Self> {
        match self.0.len() {
            0 | 1 => None,
            n => Some(Self(self.0[..n - 1].to_vec())),
        }
    }

    /// The unqualified id of the item.
    pub fn leaf(&self) -> Option<&Id> {
        self.0.last()
    }

    /// Number of path segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for an empty path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The full path, root first.
    pub fn segments(&self) -> &[Id] {
        &self.0
    }
}
