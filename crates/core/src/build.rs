//! Pipelines, builds and resources as seen by the resource cache.
//!
//! These are owned by the orchestrator. The cache only reads them; ids are
//! the primary keys of the corresponding tables.

use serde::{Deserialize, Serialize};

/// A pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
}

/// A pipeline resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub name: String,
}

/// A build, optionally belonging to a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub job_id: Option<i64>,
    pub status: BuildStatus,
}

/// Build status as stored in `builds.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Aborted,
    Errored,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
        }
    }
}
