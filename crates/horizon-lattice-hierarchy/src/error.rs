//! Error types for the hierarchy engine.
//!
//! Identities are rendered with their `Debug` representation so the error
//! type does not need to be generic over the data source's id type.

use thiserror::Error;

use crate::count::ChildCount;

/// Errors reported by a [`HierarchicalDataSource`](crate::HierarchicalDataSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    /// The backend failed to produce data.
    #[error("backend error: {0}")]
    Backend(String),

    /// The queried parent no longer exists in the source.
    #[error("parent item not found in data source")]
    ParentNotFound,

    /// The source is temporarily unable to serve requests.
    #[error("data source unavailable")]
    Unavailable,
}

impl DataSourceError {
    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Why a window fetch produced no rows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The data source failed.
    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    /// The window was rejected at ingestion.
    #[error("identity collision: {identity} is already held by another row")]
    IdentityCollision { identity: String },
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("failed to parse hierarchy configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its allowed range.
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    /// Create a validation error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Errors that can occur in the hierarchy engine.
#[derive(Error, Debug)]
pub enum HierarchyError {
    /// Two distinct fetched items reported the same identity.
    #[error("identity collision: {identity} is already held by another row")]
    IdentityCollision { identity: String },

    /// A key is no longer (or was never) known to the engine.
    #[error("unknown key '{key}'")]
    UnknownKey { key: String },

    /// An identity is not currently cached by the engine.
    #[error("unknown identity {identity}")]
    UnknownIdentity { identity: String },

    /// An operation would need to materialize an unbounded or oversized subtree.
    #[error("refusing to enumerate the children of {identity}: child count is {count}")]
    UnboundedSubtree { identity: String, count: ChildCount },

    /// Path addressing named an ancestor that is not expanded.
    #[error("path level {level} (child #{index}) is not expanded")]
    NotExpanded { level: usize, index: usize },

    /// Path addressing named a child index past the end of its parent.
    #[error("path level {level} has no child #{index}")]
    PathOutOfRange { level: usize, index: usize },

    /// A fetch for a specific window failed.
    #[error("fetch of {triple} failed: {source}")]
    FetchFailed {
        triple: String,
        #[source]
        source: FetchError,
    },

    /// The fetch thread pool could not be started.
    #[error("failed to create fetch thread pool: {0}")]
    ThreadPool(String),

    /// A data source call other than a window fetch failed.
    #[error("data source error: {0}")]
    DataSource(#[from] DataSourceError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HierarchyError {
    /// Create an identity collision error.
    pub fn collision(identity: &impl std::fmt::Debug) -> Self {
        Self::IdentityCollision {
            identity: format!("{identity:?}"),
        }
    }

    /// Create an unknown identity error.
    pub fn unknown_identity(identity: &impl std::fmt::Debug) -> Self {
        Self::UnknownIdentity {
            identity: format!("{identity:?}"),
        }
    }

    /// Create an unbounded subtree error.
    pub fn unbounded(identity: &impl std::fmt::Debug, count: ChildCount) -> Self {
        Self::UnboundedSubtree {
            identity: format!("{identity:?}"),
            count,
        }
    }
}

/// Result type for hierarchy operations.
pub type Result<T> = std::result::Result<T, HierarchyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = HierarchyError::collision(&"Aa");
        assert_eq!(
            err.to_string(),
            "identity collision: \"Aa\" is already held by another row"
        );

        let err = HierarchyError::unbounded(&7u32, ChildCount::Unknown);
        assert!(err.to_string().contains("child count is unknown"));

        let err: HierarchyError = DataSourceError::backend("boom").into();
        assert_eq!(err.to_string(), "data source error: backend error: boom");
    }

    #[test]
    fn test_fetch_failed_source() {
        use std::error::Error as _;

        let err = HierarchyError::FetchFailed {
            triple: "(root, 0, 50)".into(),
            source: DataSourceError::Unavailable.into(),
        };
        assert!(err.source().is_some());
    }
}
