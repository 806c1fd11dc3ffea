//! Find-or-create of resource configs and caches, with usage tracking.
//!
//! The flow here is written once against [`IdentityTx`], which each backend
//! implements over its own transaction type. Everything runs inside the
//! caller's transaction: either the cache and every use recorded for it
//! commit together, or nothing does.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{ResourceTypeRow, UsedResourceCache};
use crate::resolver::{ResourceConfigDescriptor, UsedResourceType, construct_resource_config};
use async_trait::async_trait;
use rescache_core::{Params, Pipeline, ResourceTypes, Source, Version, params_hash, parse_version, version_json};

/// Who is asking for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUser {
    Build(i64),
    Resource(i64),
    /// The resource type named by the request itself.
    ResourceType,
}

/// The entity a use row points at, once resolved to an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOwner {
    Build(i64),
    Resource(i64),
    ResourceType(i64),
}

impl CacheOwner {
    /// Column of `resource_cache_uses` / `resource_config_uses` holding the owner.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Build(_) => "build_id",
            Self::Resource(_) => "resource_id",
            Self::ResourceType(_) => "resource_type_id",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Build(id) | Self::Resource(id) | Self::ResourceType(id) => *id,
        }
    }
}

/// What a resource config row is created by, once persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCreator {
    BaseResourceType(i64),
    ResourceCache(i64),
}

impl ConfigCreator {
    pub fn id(&self) -> i64 {
        match self {
            Self::BaseResourceType(id) | Self::ResourceCache(id) => *id,
        }
    }
}

/// Everything needed to identify a cache.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCacheRequest<'a> {
    pub resource_type_name: &'a str,
    pub version: &'a Version,
    pub source: &'a Source,
    pub params: Option<&'a Params>,
    pub pipeline: &'a Pipeline,
    pub resource_types: &'a ResourceTypes,
}

/// Identity operations available inside an open transaction.
///
/// Every `find_or_create_*` must converge on a single row under concurrent
/// callers: look the row up, insert it with `ON CONFLICT DO NOTHING`, and
/// re-read if the insert lost the race.
#[async_trait]
pub trait IdentityTx: Send {
    /// Find an active resource type of a pipeline.
    async fn find_resource_type(
        &mut self,
        pipeline_id: i64,
        name: &str,
    ) -> MetadataResult<Option<ResourceTypeRow>>;

    async fn find_or_create_base_resource_type(&mut self, name: &str) -> MetadataResult<i64>;

    async fn find_or_create_resource_config(
        &mut self,
        created_by: ConfigCreator,
        source_hash: &str,
    ) -> MetadataResult<i64>;

    async fn find_or_create_resource_cache(
        &mut self,
        resource_config_id: i64,
        version: &str,
        params_hash: &str,
    ) -> MetadataResult<i64>;

    /// Record that `owner` uses a cache. Recording twice is a no-op.
    async fn use_resource_cache(&mut self, cache_id: i64, owner: CacheOwner) -> MetadataResult<()>;

    /// Record that `owner` uses a config. Recording twice is a no-op.
    async fn use_resource_config(
        &mut self,
        config_id: i64,
        owner: CacheOwner,
    ) -> MetadataResult<()>;
}

/// Find or create the cache described by `request` and link it to `user`.
pub async fn find_or_create_resource_cache<T>(
    tx: &mut T,
    user: CacheUser,
    request: &ResourceCacheRequest<'_>,
) -> MetadataResult<UsedResourceCache>
where
    T: IdentityTx + ?Sized,
{
    let owner = match user {
        CacheUser::Build(id) => CacheOwner::Build(id),
        CacheUser::Resource(id) => CacheOwner::Resource(id),
        CacheUser::ResourceType => {
            let row = tx
                .find_resource_type(request.pipeline.id, request.resource_type_name)
                .await?
                .ok_or_else(|| MetadataError::ResourceTypeNotFound {
                    name: request.resource_type_name.to_string(),
                })?;
            CacheOwner::ResourceType(row.id)
        }
    };

    let used_types = load_resource_types(tx, request.pipeline, request.resource_types).await?;
    let descriptor =
        construct_resource_config(request.resource_type_name, request.source, &used_types)?;
    let resource_config_id = persist_resource_config(tx, &descriptor, owner).await?;

    let version = version_json(request.version)?;
    let params_hash = params_hash(request.params)?;
    let id = tx
        .find_or_create_resource_cache(resource_config_id, &version, &params_hash)
        .await?;
    tx.use_resource_cache(id, owner).await?;

    tracing::debug!(
        cache_id = id,
        resource_config_id = resource_config_id,
        resource_type = %request.resource_type_name,
        owner = ?owner,
        "Resource cache in use"
    );

    Ok(UsedResourceCache {
        id,
        resource_config_id,
        version: request.version.clone(),
        params_hash,
    })
}

/// Pair every visible resource type with its saved row.
///
/// A declared type without an active row cannot be resolved, whether or not
/// it is on the requested chain.
async fn load_resource_types<T>(
    tx: &mut T,
    pipeline: &Pipeline,
    resource_types: &ResourceTypes,
) -> MetadataResult<Vec<UsedResourceType>>
where
    T: IdentityTx + ?Sized,
{
    let mut used = Vec::with_capacity(resource_types.len());
    for resource_type in resource_types.iter() {
        let row = tx
            .find_resource_type(pipeline.id, &resource_type.name)
            .await?
            .ok_or_else(|| MetadataError::ResourceTypeNotFound {
                name: resource_type.name.clone(),
            })?;
        let version = row.version.as_deref().map(parse_version).transpose()?;
        used.push(UsedResourceType {
            resource_type: resource_type.clone(),
            version,
        });
    }
    Ok(used)
}

/// Persist a resolved config bottom-up and return its id.
///
/// Each cache along a custom-type chain is used by `owner` too, so the image
/// a fetch depends on stays protected as long as the fetch result does.
async fn persist_resource_config<T>(
    tx: &mut T,
    descriptor: &ResourceConfigDescriptor,
    owner: CacheOwner,
) -> MetadataResult<i64>
where
    T: IdentityTx + ?Sized,
{
    let base_id = tx
        .find_or_create_base_resource_type(descriptor.base_resource_type())
        .await?;
    let mut created_by = ConfigCreator::BaseResourceType(base_id);

    for parent in descriptor.parent_caches() {
        let config_id = tx
            .find_or_create_resource_config(created_by, &parent.resource_config.source_hash()?)
            .await?;
        tx.use_resource_config(config_id, owner).await?;

        let cache_id = tx
            .find_or_create_resource_cache(config_id, &parent.version_json()?, &parent.params_hash()?)
            .await?;
        tx.use_resource_cache(cache_id, owner).await?;

        created_by = ConfigCreator::ResourceCache(cache_id);
    }

    let config_id = tx
        .find_or_create_resource_config(created_by, &descriptor.source_hash()?)
        .await?;
    tx.use_resource_config(config_id, owner).await?;
    Ok(config_id)
}
