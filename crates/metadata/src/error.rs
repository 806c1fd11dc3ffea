//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("resource type not found: {name}")]
    ResourceTypeNotFound { name: String },

    #[error("resource type chain is cyclic: {}", .chain.join(" -> "))]
    ResourceTypeCycle { chain: Vec<String> },

    #[error("version of resource type {name} is not known yet")]
    ResourceTypeVersionUnknown { name: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    Core(#[from] rescache_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether this error reports a missing resource type.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceTypeNotFound { .. })
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
