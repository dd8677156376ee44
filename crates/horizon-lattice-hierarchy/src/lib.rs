//! Hierarchical lazy-loading data virtualization for Horizon Lattice tree views.
//!
//! A tree view over a large or remote hierarchy cannot load everything up
//! front. This crate turns such a hierarchy into a single flat, virtual list
//! of rows:
//!
//! - **Flattening**: expanded subtrees are spliced into one index space; sizes
//!   are memoized per parent and updated incrementally
//! - **Stable keys**: every item gets an opaque [`ItemKey`] that survives
//!   refetches, moves and refreshes for as long as the item exists
//! - **Windowed fetching**: only the children a viewport needs are requested,
//!   in bounded `(parent, offset, limit)` windows, with in-flight
//!   deduplication and out-of-order result handling
//! - **Refresh**: single items or the whole tree can be invalidated while
//!   stale rows keep rendering until their refetch lands
//!
//! The data comes from a [`HierarchicalDataSource`]. [`TreeDataSource`],
//! [`CallbackDataSource`] and [`FlatDataSource`] cover in-memory trees,
//! paged back ends and plain lists.
//!
//! # Example
//!
//! ```
//! use horizon_lattice_hierarchy::{
//!     ChildCount, HierarchyConfig, HierarchyEngine, RecursionDepth, TreeDataSource,
//! };
//!
//! let tree = TreeDataSource::new(|path: &String| path.clone());
//! tree.add_root("docs".to_string());
//! tree.add_child(&"docs".to_string(), "docs/guide".to_string());
//! tree.add_child(&"docs/guide".to_string(), "docs/guide/intro.md".to_string());
//!
//! let mut engine = HierarchyEngine::new(tree, HierarchyConfig::default()).unwrap();
//! engine.ensure_loaded(0..20).unwrap();
//! engine
//!     .expand_recursively(&["docs".to_string()], RecursionDepth::Unbounded)
//!     .unwrap();
//! assert_eq!(engine.total_size(), ChildCount::Known(3));
//!
//! let rows: Vec<_> = engine.flatten(0..3).into_iter().map(|row| row.depth).collect();
//! assert_eq!(rows, vec![0, 1, 2]);
//! ```
//!
//! # Dispatch
//!
//! By default window fetches run inline. [`DispatchMode::Deferred`] hands
//! them to the host as [`FetchTask`]s and [`DispatchMode::ThreadPool`] runs
//! them on a rayon pool; either way results are applied by the engine on the
//! caller's thread.

mod cache;
pub mod config;
pub mod count;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod fetch;
mod flatten;
pub mod key_mapper;
pub mod logging;
pub mod refresh;
pub mod signal;
pub mod source;

pub use config::{DispatchMode, EmptyExpandedPolicy, HierarchyConfig};
pub use count::ChildCount;
pub use engine::{HierarchyEngine, Resolved};
pub use error::{ConfigError, DataSourceError, FetchError, HierarchyError, Result};
pub use expansion::{ExpansionModel, RecursionDepth};
pub use fetch::{
    CompletionOutcome, DiscardReason, FetchCompletion, FetchFailure, FetchTask, FetchTriple,
    LoadReport, RequestId,
};
pub use flatten::{FlatEntry, Location};
pub use key_mapper::{ItemKey, KeyMapper};
pub use refresh::{AnchorOutcome, ScrollAnchor};
pub use signal::{ConnectionId, HierarchySignals, Signal};
pub use source::{
    CallbackDataSource, FlatDataSource, HierarchicalDataSource, HierarchicalQuery, QualifiedId,
    TreeDataSource,
};
