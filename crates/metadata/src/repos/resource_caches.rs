//! Resource cache identity repository.

use crate::error::MetadataResult;
use crate::identity::{CacheUser, ResourceCacheRequest};
use crate::models::{
    ResourceCacheRow, ResourceCacheUseRow, ResourceConfigRow, ResourceTypeRow, UsedResourceCache,
};
use async_trait::async_trait;

/// Repository for finding, creating and using resource caches.
#[async_trait]
pub trait ResourceCacheRepo: Send + Sync {
    /// Find or create the cache for `request` and record that `user` uses it.
    ///
    /// Runs in a single transaction. On error nothing is written.
    async fn find_or_create_resource_cache(
        &self,
        user: CacheUser,
        request: &ResourceCacheRequest<'_>,
    ) -> MetadataResult<UsedResourceCache>;

    /// Find an active resource type of a pipeline by name.
    async fn find_resource_type(
        &self,
        pipeline_id: i64,
        name: &str,
    ) -> MetadataResult<Option<ResourceTypeRow>>;

    /// Get a resource cache by ID.
    async fn get_resource_cache(&self, cache_id: i64) -> MetadataResult<Option<ResourceCacheRow>>;

    /// Get a resource config by ID.
    async fn get_resource_config(
        &self,
        config_id: i64,
    ) -> MetadataResult<Option<ResourceConfigRow>>;

    /// List the use rows pointing at a cache.
    async fn list_resource_cache_uses(
        &self,
        cache_id: i64,
    ) -> MetadataResult<Vec<ResourceCacheUseRow>>;

    /// Count the use rows pointing at a cache.
    async fn count_resource_cache_uses(&self, cache_id: i64) -> MetadataResult<u64>;

    /// Count all resource cache rows.
    async fn count_resource_caches(&self) -> MetadataResult<u64>;
}
