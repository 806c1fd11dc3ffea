//! Repository traits for resource cache operations.

pub mod gc;
pub mod resource_caches;

pub use gc::{GcStats, GcSweep, ResourceCacheGcRepo};
pub use resource_caches::ResourceCacheRepo;
