//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use horizon_lattice_hierarchy::{
    CallbackDataSource, ChildCount, DataSourceError, HierarchicalDataSource, HierarchicalQuery,
    TreeDataSource,
};
use parking_lot::Mutex;

/// A fetch seen by a [`Recording`] source: (parent, offset, limit).
pub type Fetch<Id> = (Option<Id>, usize, usize);

/// Wraps a data source and records every call made to it.
pub struct Recording<S: HierarchicalDataSource> {
    inner: S,
    fetches: Mutex<Vec<Fetch<S::Id>>>,
    count_queries: AtomicUsize,
}

impl<S: HierarchicalDataSource> Recording<S> {
    pub fn new(inner: S) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fetches: Mutex::new(Vec::new()),
            count_queries: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The fetches recorded since the last call.
    pub fn take_fetches(&self) -> Vec<Fetch<S::Id>> {
        std::mem::take(&mut *self.fetches.lock())
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }
}

impl<S: HierarchicalDataSource> HierarchicalDataSource for Recording<S> {
    type Item = S::Item;
    type Id = S::Id;

    fn id_of(&self, item: &S::Item) -> S::Id {
        self.inner.id_of(item)
    }

    fn has_children(&self, item: &S::Item) -> bool {
        self.inner.has_children(item)
    }

    fn child_count(&self, query: &HierarchicalQuery<S::Item>) -> Result<ChildCount, DataSourceError> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.child_count(query)
    }

    fn fetch_children(&self, query: &HierarchicalQuery<S::Item>) -> Result<Vec<S::Item>, DataSourceError> {
        let parent = query.parent.as_ref().map(|item| self.inner.id_of(item));
        self.fetches.lock().push((parent, query.offset, query.limit));
        self.inner.fetch_children(query)
    }

    fn is_in_memory(&self) -> bool {
        self.inner.is_in_memory()
    }
}

/// `n` root-level leaves numbered from 0.
pub fn leaves(n: usize) -> CallbackDataSource<u32, u32> {
    CallbackDataSource::new(
        move |_| Ok(ChildCount::Known(n)),
        move |query| Ok(query.range().take_while(|i| *i < n).map(|i| i as u32).collect()),
        |_| false,
        |item: &u32| *item,
    )
}

/// An item of [`family`]: an identity and a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub name: String,
}

impl Person {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// 3 granddads, each with 3 dads, each with 100 sons.
///
/// Ids are paths: `g1`, `g1/d2`, `g1/d2/s57`.
pub fn family() -> TreeDataSource<Person, String> {
    let tree = TreeDataSource::new(|person: &Person| person.id.clone());
    for g in 0..3 {
        let granddad = format!("g{g}");
        tree.add_root(Person::new(&granddad, format!("Granddad {g}")));
        for d in 0..3 {
            let dad = format!("{granddad}/d{d}");
            tree.add_child(&granddad, Person::new(&dad, format!("Dad {d}")));
            for s in 0..100 {
                let son = format!("{dad}/s{s}");
                tree.add_child(&dad, Person::new(son, format!("Son {s}")));
            }
        }
    }
    tree
}

/// Installs a test log writer; set `RUST_LOG` to see engine diagnostics.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
