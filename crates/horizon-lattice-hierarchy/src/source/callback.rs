//! Lazy data source described by closures.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use super::{HierarchicalDataSource, HierarchicalQuery};
use crate::count::ChildCount;
use crate::error::DataSourceError;

type CountFn<T> =
    Arc<dyn Fn(&HierarchicalQuery<T>) -> Result<ChildCount, DataSourceError> + Send + Sync>;
type FetchFn<T> =
    Arc<dyn Fn(&HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> + Send + Sync>;
type HasChildrenFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type IdFn<T, Id> = Arc<dyn Fn(&T) -> Id + Send + Sync>;

/// A back-end data source built from closures.
///
/// This is the shape of a paged remote service: the count closure may answer
/// [`ChildCount::Unknown`] for endless feeds, and the fetch closure only ever
/// receives bounded windows.
///
/// # Example
///
/// ```
/// use horizon_lattice_hierarchy::{CallbackDataSource, ChildCount, HierarchicalDataSource, HierarchicalQuery};
///
/// // An endless list of numbers.
/// let source = CallbackDataSource::new(
///     |_| Ok(ChildCount::Unknown),
///     |query| Ok(query.range().map(|n| n as u64).collect()),
///     |_| false,
///     |n: &u64| *n,
/// );
///
/// let page = source.fetch_children(&HierarchicalQuery::new(None, 1_000_000, 3)).unwrap();
/// assert_eq!(page, vec![1_000_000, 1_000_001, 1_000_002]);
/// ```
pub struct CallbackDataSource<T, Id> {
    count_fn: CountFn<T>,
    fetch_fn: FetchFn<T>,
    has_children_fn: HasChildrenFn<T>,
    id_fn: IdFn<T, Id>,
}

impl<T, Id> CallbackDataSource<T, Id>
where
    T: Clone + Send + Sync + 'static,
    Id: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a source from its four callbacks.
    pub fn new<C, F, H, I>(count_fn: C, fetch_fn: F, has_children_fn: H, id_fn: I) -> Self
    where
        C: Fn(&HierarchicalQuery<T>) -> Result<ChildCount, DataSourceError> + Send + Sync + 'static,
        F: Fn(&HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> + Send + Sync + 'static,
        H: Fn(&T) -> bool + Send + Sync + 'static,
        I: Fn(&T) -> Id + Send + Sync + 'static,
    {
        Self {
            count_fn: Arc::new(count_fn),
            fetch_fn: Arc::new(fetch_fn),
            has_children_fn: Arc::new(has_children_fn),
            id_fn: Arc::new(id_fn),
        }
    }
}

impl<T, Id> HierarchicalDataSource for CallbackDataSource<T, Id>
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
        (self.has_children_fn)(item)
    }

    fn child_count(&self, query: &HierarchicalQuery<T>) -> Result<ChildCount, DataSourceError> {
        (self.count_fn)(query)
    }

    fn fetch_children(&self, query: &HierarchicalQuery<T>) -> Result<Vec<T>, DataSourceError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        (self.fetch_fn)(query)
    }
}

impl<T, Id> Debug for CallbackDataSource<T, Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDataSource").finish_non_exhaustive()
    }
}
