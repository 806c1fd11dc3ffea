//! Database models mapping to the resource cache schema.

use rescache_core::Version;
use sqlx::FromRow;

// =============================================================================
// Identity
// =============================================================================

/// Deduplicated resource configuration.
///
/// Exactly one of `base_resource_type_id` and `resource_cache_id` is set. A
/// config built from a custom resource type points at the cache holding that
/// type's implementation.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceConfigRow {
    pub id: i64,
    pub base_resource_type_id: Option<i64>,
    pub resource_cache_id: Option<i64>,
    pub source_hash: String,
}

/// One fetchable artifact: a config at a version with a params hash.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceCacheRow {
    pub id: i64,
    pub resource_config_id: i64,
    pub version: String,
    pub params_hash: String,
}

/// A cache handed back to the caller after its use has been recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct UsedResourceCache {
    pub id: i64,
    pub resource_config_id: i64,
    pub version: Version,
    pub params_hash: String,
}

// =============================================================================
// Usage
// =============================================================================

/// Link between a cache and the one entity that needs it.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceCacheUseRow {
    pub resource_cache_id: i64,
    pub build_id: Option<i64>,
    pub resource_id: Option<i64>,
    pub resource_type_id: Option<i64>,
}

// =============================================================================
// Orchestrator tables (read-only)
// =============================================================================

/// Resource type as saved for a pipeline.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceTypeRow {
    pub id: i64,
    pub pipeline_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub version: Option<String>,
    pub active: bool,
}
