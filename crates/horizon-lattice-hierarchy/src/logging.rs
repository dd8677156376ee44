//! Tracing targets used by the hierarchy engine.
//!
//! The engine logs through the `tracing` crate. Install any subscriber to see
//! the output, and filter by subsystem with the targets below:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_lattice_hierarchy::fetch=debug")
//!     .init();
//! ```

/// Target names for log filtering.
pub mod targets {
    /// Crate-wide target.
    pub const HIERARCHY: &str = "horizon_lattice_hierarchy";
    /// Fetch planning, dispatch and completion.
    pub const FETCH: &str = "horizon_lattice_hierarchy::fetch";
    /// Item and full refreshes, anchor restoration.
    pub const REFRESH: &str = "horizon_lattice_hierarchy::refresh";
    /// Expand and collapse operations.
    pub const EXPANSION: &str = "horizon_lattice_hierarchy::expansion";
    /// Key allocation and release.
    pub const KEYS: &str = "horizon_lattice_hierarchy::keys";
    /// Window cache ingestion and eviction.
    pub const CACHE: &str = "horizon_lattice_hierarchy::cache";
}
