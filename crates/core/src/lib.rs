//! Core domain types and shared logic for the resource cache.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Resource versions, sources and params
//! - Pipeline-declared resource types and their lookup rules
//! - Builds, jobs and resources as read by the garbage collector
//! - Canonical hashing of cache identities
//! - Configuration shared by the store and the reaper

pub mod build;
pub mod config;
pub mod error;
pub mod hash;
pub mod resource;

pub use build::{Build, BuildStatus, Pipeline, Resource};
pub use error::{Error, Result};
pub use hash::{NULL_PARAMS_HASH, params_hash, parse_version, source_hash, version_json};
pub use resource::{Params, ResourceType, ResourceTypes, Source, Version};
