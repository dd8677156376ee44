//! Engine configuration.
//!
//! [`HierarchyConfig`] can be built in code with the builder-style setters or
//! loaded from a TOML document:
//!
//! ```
//! use horizon_lattice_hierarchy::{DispatchMode, HierarchyConfig};
//!
//! let config = HierarchyConfig::from_toml_str(
//!     r#"
//!     page_size = 100
//!     prefetch_pages = 1
//!     dispatch = { mode = "thread_pool", threads = 2 }
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.page_size, 100);
//! assert_eq!(config.dispatch, DispatchMode::ThreadPool { threads: Some(2) });
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do with an expanded item once it is known to have no children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyExpandedPolicy {
    /// Collapse the item and emit `collapsed`.
    #[default]
    Collapse,
    /// Leave it expanded; it contributes no rows.
    Keep,
}

/// Where fetch tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run on the calling thread; results are applied before `ensure_loaded` returns.
    #[default]
    Inline,
    /// Queue tasks for the host to run and report back with `complete`.
    Deferred,
    /// Run on a dedicated rayon pool; results are collected with
    /// `process_completions` or `wait_for_fetches`.
    ThreadPool {
        /// Worker count; `None` uses rayon's default.
        #[serde(default)]
        threads: Option<usize>,
    },
}

/// Configuration for a [`HierarchyEngine`](crate::HierarchyEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Size of one fetch page.
    pub page_size: usize,
    /// Pages added on each side of a gap when widening it into a fetch window.
    pub prefetch_pages: usize,
    /// Whether the first load of a parent issues a first page plus a viewport-sized buffer.
    pub eager_first_page: bool,
    /// Maximum number of cached items; `None` disables eviction.
    pub cache_capacity: Option<usize>,
    /// Age after which a fetched window is considered expired, in milliseconds.
    pub window_ttl_ms: Option<u64>,
    /// Policy for expanded items that turn out to be empty.
    pub empty_expanded_policy: EmptyExpandedPolicy,
    /// Largest child count a recursive expansion may enumerate.
    pub recursive_expand_limit: usize,
    /// Fetch whole child lists from sources that report `is_in_memory`.
    pub eager_in_memory: bool,
    /// Where fetch tasks run.
    pub dispatch: DispatchMode,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            prefetch_pages: 2,
            eager_first_page: true,
            cache_capacity: Some(10_000),
            window_ttl_ms: None,
            empty_expanded_policy: EmptyExpandedPolicy::Collapse,
            recursive_expand_limit: 10_000,
            eager_in_memory: false,
            dispatch: DispatchMode::Inline,
        }
    }
}

impl HierarchyConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::invalid("page_size", "must be greater than zero"));
        }
        if self.recursive_expand_limit == 0 {
            return Err(ConfigError::invalid(
                "recursive_expand_limit",
                "must be greater than zero",
            ));
        }
        if let DispatchMode::ThreadPool { threads: Some(0) } = self.dispatch {
            return Err(ConfigError::invalid("dispatch.threads", "must be greater than zero"));
        }
        Ok(())
    }

    /// Window expiry as a [`Duration`].
    pub fn ttl(&self) -> Option<Duration> {
        self.window_ttl_ms.map(Duration::from_millis)
    }

    /// Set the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the number of prefetch pages.
    pub fn prefetch_pages(mut self, pages: usize) -> Self {
        self.prefetch_pages = pages;
        self
    }

    /// Enable or disable the eager first page.
    pub fn eager_first_page(mut self, eager: bool) -> Self {
        self.eager_first_page = eager;
        self
    }

    /// Set the cache capacity.
    pub fn cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the window expiry.
    pub fn window_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.window_ttl_ms = ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the empty expanded item policy.
    pub fn empty_expanded_policy(mut self, policy: EmptyExpandedPolicy) -> Self {
        self.empty_expanded_policy = policy;
        self
    }

    /// Set the recursive expansion limit.
    pub fn recursive_expand_limit(mut self, limit: usize) -> Self {
        self.recursive_expand_limit = limit;
        self
    }

    /// Honor `is_in_memory` hints.
    pub fn eager_in_memory(mut self, eager: bool) -> Self {
        self.eager_in_memory = eager;
        self
    }

    /// Set the dispatch mode.
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HierarchyConfig::new();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.prefetch_pages, 2);
        assert!(config.eager_first_page);
        assert_eq!(config.empty_expanded_policy, EmptyExpandedPolicy::Collapse);
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = HierarchyConfig::new()
            .page_size(20)
            .prefetch_pages(0)
            .cache_capacity(None)
            .window_ttl(Some(Duration::from_secs(2)))
            .dispatch(DispatchMode::Deferred);

        assert_eq!(config.page_size, 20);
        assert_eq!(config.prefetch_pages, 0);
        assert_eq!(config.cache_capacity, None);
        assert_eq!(config.ttl(), Some(Duration::from_secs(2)));
        assert_eq!(config.dispatch, DispatchMode::Deferred);
    }

    #[test]
    fn test_from_toml() {
        let config = HierarchyConfig::from_toml_str(
            r#"
            page_size = 25
            empty_expanded_policy = "keep"
            dispatch = { mode = "deferred" }
            "#,
        )
        .unwrap();

        assert_eq!(config.page_size, 25);
        assert_eq!(config.prefetch_pages, 2);
        assert_eq!(config.empty_expanded_policy, EmptyExpandedPolicy::Keep);
        assert_eq!(config.dispatch, DispatchMode::Deferred);
    }

    #[test]
    fn test_invalid_toml() {
        let err = HierarchyConfig::from_toml_str("page_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "page_size", .. }));

        let err = HierarchyConfig::from_toml_str("page_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
