//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::identity::{self, CacheOwner, CacheUser, ConfigCreator, IdentityTx, ResourceCacheRequest};
use crate::models::{
    ResourceCacheRow, ResourceCacheUseRow, ResourceConfigRow, ResourceTypeRow, UsedResourceCache,
};
use crate::repos::{ResourceCacheGcRepo, ResourceCacheRepo};
use async_trait::async_trait;
use rescache_core::{BuildStatus, NULL_PARAMS_HASH};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: ResourceCacheRepo + ResourceCacheGcRepo + Send + Sync {
    /// Create tables and indexes if they do not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite store and migrate it.
    ///
    /// `path` may be `:memory:` for a private in-memory database.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();
        let in_memory = path == Path::new(":memory:");

        let opts = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MetadataError::Config(e.to_string()))?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        };
        let opts = opts
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        // One connection serializes writers; an in-memory database also
        // lives only as long as its connection, so it must never be recycled.
        let mut pool_opts = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite metadata store opened");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Identity operations over an open SQLite transaction.
struct SqliteIdentityTx<'c> {
    tx: Transaction<'c, Sqlite>,
}

fn lost_race(what: &str) -> MetadataError {
    MetadataError::Internal(format!("{what} vanished after conflicting insert"))
}

#[async_trait]
impl IdentityTx for SqliteIdentityTx<'_> {
    async fn find_resource_type(
        &mut self,
        pipeline_id: i64,
        name: &str,
    ) -> MetadataResult<Option<ResourceTypeRow>> {
        let row = sqlx::query_as::<_, ResourceTypeRow>(
            "SELECT id, pipeline_id, name, type, version, active FROM resource_types
             WHERE pipeline_id = ? AND name = ? AND active = 1",
        )
        .bind(pipeline_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_or_create_base_resource_type(&mut self, name: &str) -> MetadataResult<i64> {
        const SELECT: &str = "SELECT id FROM base_resource_types WHERE name = ?";

        if let Some(id) = sqlx::query_scalar::<_, i64>(SELECT)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
        {
            return Ok(id);
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO base_resource_types (name) VALUES (?)
             ON CONFLICT (name) DO NOTHING RETURNING id",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = inserted {
            return Ok(id);
        }

        sqlx::query_scalar::<_, i64>(SELECT)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| lost_race("base resource type"))
    }

    async fn find_or_create_resource_config(
        &mut self,
        created_by: ConfigCreator,
        source_hash: &str,
    ) -> MetadataResult<i64> {
        let (select, insert) = match created_by {
            ConfigCreator::BaseResourceType(_) => (
                "SELECT id FROM resource_configs
                 WHERE base_resource_type_id = ? AND source_hash = ?",
                "INSERT INTO resource_configs (base_resource_type_id, source_hash) VALUES (?, ?)
                 ON CONFLICT (base_resource_type_id, source_hash)
                 WHERE base_resource_type_id IS NOT NULL DO NOTHING RETURNING id",
            ),
            ConfigCreator::ResourceCache(_) => (
                "SELECT id FROM resource_configs
                 WHERE resource_cache_id = ? AND source_hash = ?",
                "INSERT INTO resource_configs (resource_cache_id, source_hash) VALUES (?, ?)
                 ON CONFLICT (resource_cache_id, source_hash)
                 WHERE resource_cache_id IS NOT NULL DO NOTHING RETURNING id",
            ),
        };

        if let Some(id) = sqlx::query_scalar::<_, i64>(select)
            .bind(created_by.id())
            .bind(source_hash)
            .fetch_optional(&mut *self.tx)
            .await?
        {
            return Ok(id);
        }

        let inserted: Option<i64> = sqlx::query_scalar(insert)
            .bind(created_by.id())
            .bind(source_hash)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(id) = inserted {
            return Ok(id);
        }

        sqlx::query_scalar::<_, i64>(select)
            .bind(created_by.id())
            .bind(source_hash)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| lost_race("resource config"))
    }

    async fn find_or_create_resource_cache(
        &mut self,
        resource_config_id: i64,
        version: &str,
        params_hash: &str,
    ) -> MetadataResult<i64> {
        const SELECT: &str = "SELECT id FROM resource_caches
             WHERE resource_config_id = ? AND version = ? AND params_hash = ?";

        if let Some(id) = sqlx::query_scalar::<_, i64>(SELECT)
            .bind(resource_config_id)
            .bind(version)
            .bind(params_hash)
            .fetch_optional(&mut *self.tx)
            .await?
        {
            return Ok(id);
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO resource_caches (resource_config_id, version, params_hash)
             VALUES (?, ?, ?)
             ON CONFLICT (resource_config_id, version, params_hash) DO NOTHING RETURNING id",
        )
        .bind(resource_config_id)
        .bind(version)
        .bind(params_hash)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = inserted {
            return Ok(id);
        }

        sqlx::query_scalar::<_, i64>(SELECT)
            .bind(resource_config_id)
            .bind(version)
            .bind(params_hash)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| lost_race("resource cache"))
    }

    async fn use_resource_cache(&mut self, cache_id: i64, owner: CacheOwner) -> MetadataResult<()> {
        let sql = format!(
            "INSERT INTO resource_cache_uses (resource_cache_id, {}) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
            owner.column()
        );
        sqlx::query(&sql)
            .bind(cache_id)
            .bind(owner.id())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn use_resource_config(
        &mut self,
        config_id: i64,
        owner: CacheOwner,
    ) -> MetadataResult<()> {
        let sql = format!(
            "INSERT INTO resource_config_uses (resource_config_id, {}) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
            owner.column()
        );
        sqlx::query(&sql)
            .bind(config_id)
            .bind(owner.id())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceCacheRepo for SqliteStore {
    async fn find_or_create_resource_cache(
        &self,
        user: CacheUser,
        request: &ResourceCacheRequest<'_>,
    ) -> MetadataResult<UsedResourceCache> {
        let mut tx = SqliteIdentityTx {
            tx: self.pool.begin().await?,
        };
        let used = identity::find_or_create_resource_cache(&mut tx, user, request).await?;
        tx.tx.commit().await?;
        Ok(used)
    }

    async fn find_resource_type(
        &self,
        pipeline_id: i64,
        name: &str,
    ) -> MetadataResult<Option<ResourceTypeRow>> {
        let row = sqlx::query_as::<_, ResourceTypeRow>(
            "SELECT id, pipeline_id, name, type, version, active FROM resource_types
             WHERE pipeline_id = ? AND name = ? AND active = 1",
        )
        .bind(pipeline_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_resource_cache(&self, cache_id: i64) -> MetadataResult<Option<ResourceCacheRow>> {
        let row = sqlx::query_as::<_, ResourceCacheRow>(
            "SELECT id, resource_config_id, version, params_hash FROM resource_caches WHERE id = ?",
        )
        .bind(cache_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_resource_config(
        &self,
        config_id: i64,
    ) -> MetadataResult<Option<ResourceConfigRow>> {
        let row = sqlx::query_as::<_, ResourceConfigRow>(
            "SELECT id, base_resource_type_id, resource_cache_id, source_hash
             FROM resource_configs WHERE id = ?",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_resource_cache_uses(
        &self,
        cache_id: i64,
    ) -> MetadataResult<Vec<ResourceCacheUseRow>> {
        let rows = sqlx::query_as::<_, ResourceCacheUseRow>(
            "SELECT resource_cache_id, build_id, resource_id, resource_type_id
             FROM resource_cache_uses WHERE resource_cache_id = ?",
        )
        .bind(cache_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_resource_cache_uses(&self, cache_id: i64) -> MetadataResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM resource_cache_uses WHERE resource_cache_id = ?")
                .bind(cache_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn count_resource_caches(&self) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resource_caches")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl ResourceCacheGcRepo for SqliteStore {
    async fn clean_uses_for_finished_builds(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM resource_cache_uses
            WHERE build_id IN (
                SELECT b.id FROM builds b
                WHERE b.status IN (?, ?)
                   OR (b.status = ? AND b.id NOT IN (
                        -- latest build of every job
                        SELECT MAX(lb.id) FROM builds lb
                        INNER JOIN jobs j ON j.id = lb.job_id
                        GROUP BY j.id
                   ))
            )
            "#,
        )
        .bind(BuildStatus::Succeeded.as_str())
        .bind(BuildStatus::Aborted.as_str())
        .bind(BuildStatus::Failed.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn clean_uses_for_inactive_resource_types(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM resource_cache_uses
             WHERE resource_type_id IN (SELECT id FROM resource_types WHERE active = 0)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn clean_uses_for_inactive_resources(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM resource_cache_uses
             WHERE resource_id IN (SELECT id FROM resources WHERE active = 0)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn clean_up_invalid_caches(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(INVALID_CACHES_SQL)
            .bind(NULL_PARAMS_HASH)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Delete every cache outside the protected set.
///
/// Protected: images of each job's latest build (params-less caches of a
/// config that build used, at the recorded version), next build inputs of
/// active resources whose source still matches, anything with a use row, and
/// transitively the cache each protected cache's config is created by.
const INVALID_CACHES_SQL: &str = r#"
WITH RECURSIVE
latest_builds AS (
    SELECT MAX(b.id) AS build_id
    FROM builds b
    INNER JOIN jobs j ON j.id = b.job_id
    GROUP BY j.id
),
seeds AS (
    SELECT rc.id
    FROM image_resource_versions irv
    INNER JOIN latest_builds lb ON lb.build_id = irv.build_id
    INNER JOIN resource_config_uses rfu ON rfu.build_id = irv.build_id
    INNER JOIN resource_caches rc ON rc.resource_config_id = rfu.resource_config_id
    WHERE rc.params_hash = ? AND rc.version = irv.version
    UNION
    SELECT rc.id
    FROM next_build_inputs nbi
    INNER JOIN versioned_resources vr ON vr.id = nbi.version_id
    INNER JOIN resources r ON r.id = vr.resource_id
    INNER JOIN resource_caches rc ON rc.version = vr.version
    INNER JOIN resource_configs rf ON rf.id = rc.resource_config_id
    WHERE r.active = 1 AND r.source_hash = rf.source_hash
    UNION
    SELECT resource_cache_id FROM resource_cache_uses
),
protected(id) AS (
    SELECT id FROM seeds
    UNION
    SELECT rf.resource_cache_id
    FROM protected p
    INNER JOIN resource_caches rc ON rc.id = p.id
    INNER JOIN resource_configs rf ON rf.id = rc.resource_config_id
    WHERE rf.resource_cache_id IS NOT NULL
)
DELETE FROM resource_caches WHERE id NOT IN (SELECT id FROM protected)
"#;

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Orchestrator tables. Read-only to the resource cache.
CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE (pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER REFERENCES jobs(id) ON DELETE CASCADE,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_builds_job ON builds(job_id, id);
CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status);

CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    source_hash TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    version TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS versioned_resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    UNIQUE (resource_id, version)
);

CREATE TABLE IF NOT EXISTS next_build_inputs (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    input_name TEXT NOT NULL,
    version_id INTEGER NOT NULL REFERENCES versioned_resources(id) ON DELETE CASCADE,
    PRIMARY KEY (job_id, input_name)
);

CREATE TABLE IF NOT EXISTS image_resource_versions (
    build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    UNIQUE (build_id, version)
);

-- Cache identity
CREATE TABLE IF NOT EXISTS base_resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS resource_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_resource_type_id INTEGER REFERENCES base_resource_types(id) ON DELETE CASCADE,
    resource_cache_id INTEGER REFERENCES resource_caches(id) ON DELETE CASCADE,
    source_hash TEXT NOT NULL,
    CHECK ((base_resource_type_id IS NULL) <> (resource_cache_id IS NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_configs_base
    ON resource_configs(base_resource_type_id, source_hash)
    WHERE base_resource_type_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_configs_cache
    ON resource_configs(resource_cache_id, source_hash)
    WHERE resource_cache_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS resource_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    UNIQUE (resource_config_id, version, params_hash)
);
CREATE INDEX IF NOT EXISTS idx_resource_caches_version ON resource_caches(version);

-- Usage. A cache with uses can only be deleted once its uses are pruned.
CREATE TABLE IF NOT EXISTS resource_cache_uses (
    resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id),
    build_id INTEGER REFERENCES builds(id) ON DELETE CASCADE,
    resource_id INTEGER REFERENCES resources(id) ON DELETE CASCADE,
    resource_type_id INTEGER REFERENCES resource_types(id) ON DELETE CASCADE,
    CHECK ((build_id IS NOT NULL) + (resource_id IS NOT NULL) + (resource_type_id IS NOT NULL) = 1)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_cache_uses_build
    ON resource_cache_uses(resource_cache_id, build_id) WHERE build_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_cache_uses_resource
    ON resource_cache_uses(resource_cache_id, resource_id) WHERE resource_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_cache_uses_resource_type
    ON resource_cache_uses(resource_cache_id, resource_type_id) WHERE resource_type_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_resource_cache_uses_build_id ON resource_cache_uses(build_id);

CREATE TABLE IF NOT EXISTS resource_config_uses (
    resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id) ON DELETE CASCADE,
    build_id INTEGER REFERENCES builds(id) ON DELETE CASCADE,
    resource_id INTEGER REFERENCES resources(id) ON DELETE CASCADE,
    resource_type_id INTEGER REFERENCES resource_types(id) ON DELETE CASCADE,
    CHECK ((build_id IS NOT NULL) + (resource_id IS NOT NULL) + (resource_type_id IS NOT NULL) = 1)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_config_uses_build
    ON resource_config_uses(resource_config_id, build_id) WHERE build_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_config_uses_resource
    ON resource_config_uses(resource_config_id, resource_id) WHERE resource_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_config_uses_resource_type
    ON resource_config_uses(resource_config_id, resource_type_id) WHERE resource_type_id IS NOT NULL;
"#;
