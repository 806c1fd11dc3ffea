//! Entry points used by the orchestrator to obtain and reclaim resource caches.

use crate::error::{MetadataError, MetadataResult};
use crate::identity::{CacheUser, ResourceCacheRequest};
use crate::models::UsedResourceCache;
use crate::repos::{GcStats, GcSweep};
use crate::store::MetadataStore;
use rescache_core::{Build, Params, Pipeline, Resource, ResourceTypes, Source, Version};
use std::sync::Arc;

/// Finds, creates, and garbage-collects resource caches.
#[derive(Clone)]
pub struct ResourceCacheFactory {
    store: Arc<dyn MetadataStore>,
}

impl ResourceCacheFactory {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Cache fetched by a build, e.g. a `get` step or a task image.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_for_build(
        &self,
        build: &Build,
        resource_type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        pipeline: &Pipeline,
        resource_types: &ResourceTypes,
    ) -> MetadataResult<UsedResourceCache> {
        let request = ResourceCacheRequest {
            resource_type_name,
            version,
            source,
            params,
            pipeline,
            resource_types,
        };
        self.store
            .find_or_create_resource_cache(CacheUser::Build(build.id), &request)
            .await
    }

    /// Cache held on behalf of a pipeline resource, e.g. its latest version.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_for_resource(
        &self,
        resource: &Resource,
        resource_type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        pipeline: &Pipeline,
        resource_types: &ResourceTypes,
    ) -> MetadataResult<UsedResourceCache> {
        let request = ResourceCacheRequest {
            resource_type_name,
            version,
            source,
            params,
            pipeline,
            resource_types,
        };
        self.store
            .find_or_create_resource_cache(CacheUser::Resource(resource.id), &request)
            .await
    }

    /// Cache held by the resource type named `resource_type_name` itself.
    ///
    /// The type must be visible in `resource_types` and saved for the
    /// pipeline. Nothing is written otherwise.
    pub async fn find_or_create_for_resource_type(
        &self,
        resource_type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        pipeline: &Pipeline,
        resource_types: &ResourceTypes,
    ) -> MetadataResult<UsedResourceCache> {
        if resource_types.lookup(resource_type_name).is_none() {
            return Err(MetadataError::ResourceTypeNotFound {
                name: resource_type_name.to_string(),
            });
        }

        let request = ResourceCacheRequest {
            resource_type_name,
            version,
            source,
            params,
            pipeline,
            resource_types,
        };
        self.store
            .find_or_create_resource_cache(CacheUser::ResourceType, &request)
            .await
    }

    pub async fn clean_uses_for_finished_builds(&self) -> MetadataResult<u64> {
        self.run_sweep(GcSweep::FinishedBuildUses).await
    }

    pub async fn clean_uses_for_inactive_resource_types(&self) -> MetadataResult<u64> {
        self.run_sweep(GcSweep::InactiveResourceTypeUses).await
    }

    pub async fn clean_uses_for_inactive_resources(&self) -> MetadataResult<u64> {
        self.run_sweep(GcSweep::InactiveResourceUses).await
    }

    pub async fn clean_up_invalid_caches(&self) -> MetadataResult<u64> {
        self.run_sweep(GcSweep::InvalidCaches).await
    }

    /// Run a single sweep and return the number of rows it deleted.
    pub async fn run_sweep(&self, sweep: GcSweep) -> MetadataResult<u64> {
        let deleted = match sweep {
            GcSweep::FinishedBuildUses => self.store.clean_uses_for_finished_builds().await,
            GcSweep::InactiveResourceTypeUses => {
                self.store.clean_uses_for_inactive_resource_types().await
            }
            GcSweep::InactiveResourceUses => self.store.clean_uses_for_inactive_resources().await,
            GcSweep::InvalidCaches => self.store.clean_up_invalid_caches().await,
        }
        .inspect_err(|e| tracing::warn!(sweep = sweep.as_str(), error = %e, "GC sweep failed"))?;

        if deleted > 0 {
            tracing::info!(sweep = sweep.as_str(), deleted, "GC sweep deleted rows");
        } else {
            tracing::debug!(sweep = sweep.as_str(), "GC sweep found nothing to delete");
        }
        Ok(deleted)
    }

    /// Run every sweep in order. Stops at the first failure.
    pub async fn collect_garbage(&self) -> MetadataResult<GcStats> {
        let mut stats = GcStats::default();
        for sweep in GcSweep::ALL {
            let deleted = self.run_sweep(sweep).await?;
            stats.record(sweep, deleted);
        }
        Ok(stats)
    }
}
