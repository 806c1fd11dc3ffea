//! Resource configuration resolution.
//!
//! A resource of a custom type is fetched by a container image that is itself
//! a resource cache: the cache of the custom type's underlying resource at the
//! custom type's current version. Resolution walks that chain through the
//! pipeline's declared types until it reaches a built-in type, and produces a
//! descriptor the identity store can persist bottom-up.

use crate::error::{MetadataError, MetadataResult};
use rescache_core::{Params, ResourceType, Source, Version, params_hash, source_hash, version_json};

/// A pipeline resource type together with its saved version.
#[derive(Debug, Clone)]
pub struct UsedResourceType {
    pub resource_type: ResourceType,
    /// Current version of the type's image. `None` until it has been checked.
    pub version: Option<Version>,
}

/// What a resource configuration is built from.
#[derive(Debug, Clone, PartialEq)]
pub enum CreatedBy {
    BaseResourceType(String),
    ResourceCache(Box<ResourceCacheDescriptor>),
}

/// Resolved, not yet persisted, resource configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfigDescriptor {
    pub created_by: CreatedBy,
    pub source: Source,
}

/// Resolved, not yet persisted, resource cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCacheDescriptor {
    pub resource_config: ResourceConfigDescriptor,
    pub version: Version,
    pub params: Option<Params>,
}

impl ResourceConfigDescriptor {
    /// Name of the built-in type at the bottom of the chain.
    pub fn base_resource_type(&self) -> &str {
        let mut config = self;
        loop {
            match &config.created_by {
                CreatedBy::BaseResourceType(name) => return name,
                CreatedBy::ResourceCache(cache) => config = &cache.resource_config,
            }
        }
    }

    /// Caches this config is built from, innermost first.
    pub fn parent_caches(&self) -> Vec<&ResourceCacheDescriptor> {
        let mut parents = Vec::new();
        let mut config = self;
        while let CreatedBy::ResourceCache(cache) = &config.created_by {
            parents.push(cache.as_ref());
            config = &cache.resource_config;
        }
        parents.reverse();
        parents
    }

    pub fn source_hash(&self) -> MetadataResult<String> {
        Ok(source_hash(&self.source)?)
    }
}

impl ResourceCacheDescriptor {
    pub fn version_json(&self) -> MetadataResult<String> {
        Ok(version_json(&self.version)?)
    }

    pub fn params_hash(&self) -> MetadataResult<String> {
        Ok(params_hash(self.params.as_ref())?)
    }
}

/// Resolve the configuration of a `resource_type_name` resource with `source`.
///
/// Names not declared in `resource_types` are built-in types. A declared type
/// whose own type has the same name shadows that built-in and resolves to it.
/// Any other revisit of a type already on the chain is rejected.
pub fn construct_resource_config(
    resource_type_name: &str,
    source: &Source,
    resource_types: &[UsedResourceType],
) -> MetadataResult<ResourceConfigDescriptor> {
    let mut chain: Vec<&UsedResourceType> = Vec::new();
    let mut current = resource_type_name;

    while let Some(used) = resource_types
        .iter()
        .find(|t| t.resource_type.name == current)
    {
        if chain.iter().any(|t| t.resource_type.name == current) {
            let mut names: Vec<String> = chain
                .iter()
                .map(|t| t.resource_type.name.clone())
                .collect();
            names.push(current.to_string());
            return Err(MetadataError::ResourceTypeCycle { chain: names });
        }
        chain.push(used);

        let next = used.resource_type.kind.as_str();
        if next == used.resource_type.name {
            break;
        }
        current = next;
    }

    let base = match chain.last() {
        Some(last) => last.resource_type.kind.clone(),
        None => resource_type_name.to_string(),
    };
    let mut created_by = CreatedBy::BaseResourceType(base);

    for used in chain.iter().rev() {
        let version = used
            .version
            .clone()
            .ok_or_else(|| MetadataError::ResourceTypeVersionUnknown {
                name: used.resource_type.name.clone(),
            })?;
        created_by = CreatedBy::ResourceCache(Box::new(ResourceCacheDescriptor {
            resource_config: ResourceConfigDescriptor {
                created_by,
                source: used.resource_type.source.clone(),
            },
            version,
            params: None,
        }));
    }

    Ok(ResourceConfigDescriptor {
        created_by,
        source: source.clone(),
    })
}
