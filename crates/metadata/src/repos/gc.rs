//! Resource cache garbage collection repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Repository for resource cache reclamation.
///
/// Each sweep runs in its own transaction and is idempotent. Use pruning must
/// run before [`clean_up_invalid_caches`](Self::clean_up_invalid_caches) for
/// the caches it orphans to be reclaimed in the same cycle.
#[async_trait]
pub trait ResourceCacheGcRepo: Send + Sync {
    /// Delete uses held by builds that no longer need them: succeeded,
    /// aborted, and failed builds that are not the latest of their job.
    async fn clean_uses_for_finished_builds(&self) -> MetadataResult<u64>;

    /// Delete uses held by resource types removed from their pipeline.
    async fn clean_uses_for_inactive_resource_types(&self) -> MetadataResult<u64>;

    /// Delete uses held by resources removed from their pipeline.
    async fn clean_uses_for_inactive_resources(&self) -> MetadataResult<u64>;

    /// Delete caches that are neither used, nor a next build input of an
    /// active resource, nor the image of a job's latest build, nor the image
    /// another kept cache is built from.
    async fn clean_up_invalid_caches(&self) -> MetadataResult<u64>;
}

/// The sweeps of one reclamation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcSweep {
    FinishedBuildUses,
    InactiveResourceTypeUses,
    InactiveResourceUses,
    InvalidCaches,
}

impl GcSweep {
    /// All sweeps, in the order a cycle must run them.
    pub const ALL: [GcSweep; 4] = [
        GcSweep::FinishedBuildUses,
        GcSweep::InactiveResourceTypeUses,
        GcSweep::InactiveResourceUses,
        GcSweep::InvalidCaches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinishedBuildUses => "finished_build_uses",
            Self::InactiveResourceTypeUses => "inactive_resource_type_uses",
            Self::InactiveResourceUses => "inactive_resource_uses",
            Self::InvalidCaches => "invalid_caches",
        }
    }
}

/// Rows deleted by one reclamation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    pub finished_build_uses: u64,
    pub inactive_resource_type_uses: u64,
    pub inactive_resource_uses: u64,
    pub invalid_caches: u64,
}

impl GcStats {
    pub fn record(&mut self, sweep: GcSweep, deleted: u64) {
        match sweep {
            GcSweep::FinishedBuildUses => self.finished_build_uses += deleted,
            GcSweep::InactiveResourceTypeUses => self.inactive_resource_type_uses += deleted,
            GcSweep::InactiveResourceUses => self.inactive_resource_uses += deleted,
            GcSweep::InvalidCaches => self.invalid_caches += deleted,
        }
    }

    pub fn uses_deleted(&self) -> u64 {
        self.finished_build_uses + self.inactive_resource_type_uses + self.inactive_resource_uses
    }
}
