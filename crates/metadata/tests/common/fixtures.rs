//! Seeding of orchestrator rows the resource cache reads but never writes.

use rescache_core::{Build, BuildStatus, Pipeline, Resource, Source, Version, source_hash, version_json};
use serde_json::json;
use sqlx::{Pool, Postgres, Sqlite};

/// Bind value for a seeding statement.
#[derive(Debug, Clone)]
pub enum Arg {
    Int(i64),
    OptInt(Option<i64>),
    Text(String),
    OptText(Option<String>),
    Bool(bool),
}

/// Raw access to the backing database of a test store.
#[derive(Clone)]
pub enum Seeder {
    Sqlite(Pool<Sqlite>),
    Postgres(Pool<Postgres>),
}

/// Rewrite `?` placeholders as `$1`, `$2`, ...
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for c in sql.chars() {
        if c == '?' {
            n += 1;
            out.push_str(&format!("${n}"));
        } else {
            out.push(c);
        }
    }
    out
}

#[allow(dead_code)]
impl Seeder {
    /// Execute a statement written with `?` placeholders.
    pub async fn execute(&self, sql: &str, args: &[Arg]) -> u64 {
        match self {
            Seeder::Sqlite(pool) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = match arg.clone() {
                        Arg::Int(v) => query.bind(v),
                        Arg::OptInt(v) => query.bind(v),
                        Arg::Text(v) => query.bind(v),
                        Arg::OptText(v) => query.bind(v),
                        Arg::Bool(v) => query.bind(v),
                    };
                }
                query.execute(pool).await.expect("seed statement").rows_affected()
            }
            Seeder::Postgres(pool) => {
                let sql = numbered_placeholders(sql);
                let mut query = sqlx::query(&sql);
                for arg in args {
                    query = match arg.clone() {
                        Arg::Int(v) => query.bind(v),
                        Arg::OptInt(v) => query.bind(v),
                        Arg::Text(v) => query.bind(v),
                        Arg::OptText(v) => query.bind(v),
                        Arg::Bool(v) => query.bind(v),
                    };
                }
                query.execute(pool).await.expect("seed statement").rows_affected()
            }
        }
    }

    /// Fetch a single integer, e.g. from `INSERT ... RETURNING id`.
    pub async fn fetch_i64(&self, sql: &str, args: &[Arg]) -> i64 {
        match self {
            Seeder::Sqlite(pool) => {
                let mut query = sqlx::query_scalar::<_, i64>(sql);
                for arg in args {
                    query = match arg.clone() {
                        Arg::Int(v) => query.bind(v),
                        Arg::OptInt(v) => query.bind(v),
                        Arg::Text(v) => query.bind(v),
                        Arg::OptText(v) => query.bind(v),
                        Arg::Bool(v) => query.bind(v),
                    };
                }
                query.fetch_one(pool).await.expect("seed insert")
            }
            Seeder::Postgres(pool) => {
                let sql = numbered_placeholders(sql);
                let mut query = sqlx::query_scalar::<_, i64>(&sql);
                for arg in args {
                    query = match arg.clone() {
                        Arg::Int(v) => query.bind(v),
                        Arg::OptInt(v) => query.bind(v),
                        Arg::Text(v) => query.bind(v),
                        Arg::OptText(v) => query.bind(v),
                        Arg::Bool(v) => query.bind(v),
                    };
                }
                query.fetch_one(pool).await.expect("seed insert")
            }
        }
    }

    /// Count rows of `table` matching an optional `?`-placeholder filter.
    pub async fn count(&self, table: &str, filter: &str, args: &[Arg]) -> i64 {
        let sql = if filter.is_empty() {
            format!("SELECT COUNT(*) FROM {table}")
        } else {
            format!("SELECT COUNT(*) FROM {table} WHERE {filter}")
        };
        self.fetch_i64(&sql, args).await
    }

    pub async fn pipeline(&self, name: &str) -> Pipeline {
        let id = self
            .fetch_i64(
                "INSERT INTO pipelines (name) VALUES (?) RETURNING id",
                &[Arg::Text(name.to_string())],
            )
            .await;
        Pipeline {
            id,
            name: name.to_string(),
        }
    }

    pub async fn job(&self, pipeline: &Pipeline, name: &str) -> i64 {
        self.fetch_i64(
            "INSERT INTO jobs (pipeline_id, name) VALUES (?, ?) RETURNING id",
            &[Arg::Int(pipeline.id), Arg::Text(name.to_string())],
        )
        .await
    }

    /// Create a build. `job_id` of `None` makes a one-off build.
    pub async fn build(&self, job_id: Option<i64>, status: BuildStatus) -> Build {
        let id = self
            .fetch_i64(
                "INSERT INTO builds (job_id, status) VALUES (?, ?) RETURNING id",
                &[Arg::OptInt(job_id), Arg::Text(status.as_str().to_string())],
            )
            .await;
        Build { id, job_id, status }
    }

    pub async fn finish_build(&self, build: &mut Build, status: BuildStatus) {
        self.execute(
            "UPDATE builds SET status = ? WHERE id = ?",
            &[Arg::Text(status.as_str().to_string()), Arg::Int(build.id)],
        )
        .await;
        build.status = status;
    }

    /// Create an active resource configured with `source`.
    pub async fn resource(&self, pipeline: &Pipeline, name: &str, source: &Source) -> Resource {
        let hash = source_hash(source).expect("source hash");
        let id = self
            .fetch_i64(
                "INSERT INTO resources (pipeline_id, name, source_hash, active) VALUES (?, ?, ?, ?) RETURNING id",
                &[
                    Arg::Int(pipeline.id),
                    Arg::Text(name.to_string()),
                    Arg::Text(hash),
                    Arg::Bool(true),
                ],
            )
            .await;
        Resource {
            id,
            name: name.to_string(),
        }
    }

    pub async fn set_resource_active(&self, resource: &Resource, active: bool) {
        self.execute(
            "UPDATE resources SET active = ? WHERE id = ?",
            &[Arg::Bool(active), Arg::Int(resource.id)],
        )
        .await;
    }

    pub async fn set_resource_source(&self, resource: &Resource, source: &Source) {
        let hash = source_hash(source).expect("source hash");
        self.execute(
            "UPDATE resources SET source_hash = ? WHERE id = ?",
            &[Arg::Text(hash), Arg::Int(resource.id)],
        )
        .await;
    }

    /// Save an active resource type of a pipeline.
    pub async fn resource_type(
        &self,
        pipeline: &Pipeline,
        name: &str,
        kind: &str,
        version: Option<&Version>,
    ) -> i64 {
        let version = version.map(|v| version_json(v).expect("version json"));
        self.fetch_i64(
            "INSERT INTO resource_types (pipeline_id, name, type, version, active) VALUES (?, ?, ?, ?, ?) RETURNING id",
            &[
                Arg::Int(pipeline.id),
                Arg::Text(name.to_string()),
                Arg::Text(kind.to_string()),
                Arg::OptText(version),
                Arg::Bool(true),
            ],
        )
        .await
    }

    pub async fn set_resource_type_active(&self, resource_type_id: i64, active: bool) {
        self.execute(
            "UPDATE resource_types SET active = ? WHERE id = ?",
            &[Arg::Bool(active), Arg::Int(resource_type_id)],
        )
        .await;
    }

    pub async fn versioned_resource(&self, resource: &Resource, version: &Version) -> i64 {
        self.fetch_i64(
            "INSERT INTO versioned_resources (resource_id, version) VALUES (?, ?) RETURNING id",
            &[
                Arg::Int(resource.id),
                Arg::Text(version_json(version).expect("version json")),
            ],
        )
        .await
    }

    pub async fn next_build_input(&self, job_id: i64, input_name: &str, versioned_resource_id: i64) {
        self.execute(
            "INSERT INTO next_build_inputs (job_id, input_name, version_id) VALUES (?, ?, ?)",
            &[
                Arg::Int(job_id),
                Arg::Text(input_name.to_string()),
                Arg::Int(versioned_resource_id),
            ],
        )
        .await;
    }

    /// Record that `build` ran in the image at `version`.
    pub async fn image_resource_version(&self, build: &Build, version: &Version) {
        self.execute(
            "INSERT INTO image_resource_versions (build_id, version) VALUES (?, ?)",
            &[
                Arg::Int(build.id),
                Arg::Text(version_json(version).expect("version json")),
            ],
        )
        .await;
    }

    pub async fn delete_cache_uses(&self, cache_id: i64) {
        self.execute(
            "DELETE FROM resource_cache_uses WHERE resource_cache_id = ?",
            &[Arg::Int(cache_id)],
        )
        .await;
    }
}

/// Single-key version.
#[allow(dead_code)]
pub fn version(value: &str) -> Version {
    Version::from([("ref".to_string(), value.to_string())])
}

/// Single-key source.
#[allow(dead_code)]
pub fn source(uri: &str) -> Source {
    Source::from([("uri".to_string(), json!(uri))])
}
