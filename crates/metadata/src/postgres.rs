//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::identity::{self, CacheOwner, CacheUser, ConfigCreator, IdentityTx, ResourceCacheRequest};
use crate::models::{
    ResourceCacheRow, ResourceCacheUseRow, ResourceConfigRow, ResourceTypeRow, UsedResourceCache,
};
use crate::repos::{ResourceCacheGcRepo, ResourceCacheRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use rescache_core::config::PgSslMode;
use rescache_core::{BuildStatus, NULL_PARAMS_HASH};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Transaction};
use std::str::FromStr;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password arrive separately, e.g. from the environment.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Shorthand for [`PostgresStore::from_url`].
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        Self::from_url(url, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        // Bounds a sweep on the server side even if the client-side timeout
        // never fires.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // resource_configs and resource_caches reference each other, so one
        // side of the cycle is attached after both tables exist.
        let has_creator_fk: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = 'resource_configs_resource_cache_id_fkey')",
        )
        .fetch_one(&self.pool)
        .await?;
        if !has_creator_fk {
            sqlx::query(
                r#"
                ALTER TABLE resource_configs
                ADD CONSTRAINT resource_configs_resource_cache_id_fkey
                FOREIGN KEY (resource_cache_id) REFERENCES resource_caches(id) ON DELETE CASCADE
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Identity operations over an open PostgreSQL transaction.
///
/// Existing caches are read `FOR SHARE` so a concurrent sweep cannot delete
/// one between the lookup and the use row being written.
struct PgIdentityTx<'c> {
    tx: Transaction<'c, Postgres>,
}

fn lost_race(what: &str) -> MetadataError {
    MetadataError::Internal(format!("{what} vanished after conflicting insert"))
}

#[async_trait]
impl IdentityTx for PgIdentityTx<'_> {
    async fn find_resource_type(
        &mut self,
        pipeline_id: i64,
        name: &str,
    ) -> MetadataResult<Option<ResourceTypeRow>> {
        let row = sqlx::query_as::<_, ResourceTypeRow>(
            "SELECT id, pipeline_id, name, type, version, active FROM resource_types
             WHERE pipeline_id = $1 AND name = $2 AND active",
        )
        .bind(pipeline_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_or_create_base_resource_type(&mut self, name: &str) -> MetadataResult<i64> {
        const SELECT: &str = "SELECT id FROM base_resource_types WHERE name = $1";

        if let Some(id) = sqlx::query_scalar::<_, i64>(SELECT)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
        {
            return Ok(id);
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO base_resource_types (name) VALUES ($1)
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
                 WHERE base_resource_type_id = $1 AND source_hash = $2 FOR SHARE",
                "INSERT INTO resource_configs (base_resource_type_id, source_hash) VALUES ($1, $2)
                 ON CONFLICT (base_resource_type_id, source_hash)
                 WHERE base_resource_type_id IS NOT NULL DO NOTHING RETURNING id",
            ),
            ConfigCreator::ResourceCache(_) => (
                "SELECT id FROM resource_configs
                 WHERE resource_cache_id = $1 AND source_hash = $2 FOR SHARE",
                "INSERT INTO resource_configs (resource_cache_id, source_hash) VALUES ($1, $2)
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
             WHERE resource_config_id = $1 AND version = $2 AND params_hash = $3 FOR SHARE";

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
             VALUES ($1, $2, $3)
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
            "INSERT INTO resource_cache_uses (resource_cache_id, {}) VALUES ($1, $2)
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
            "INSERT INTO resource_config_uses (resource_config_id, {}) VALUES ($1, $2)
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
impl ResourceCacheRepo for PostgresStore {
    async fn find_or_create_resource_cache(
        &self,
        user: CacheUser,
        request: &ResourceCacheRequest<'_>,
    ) -> MetadataResult<UsedResourceCache> {
        let mut tx = PgIdentityTx {
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
             WHERE pipeline_id = $1 AND name = $2 AND active",
        )
        .bind(pipeline_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_resource_cache(&self, cache_id: i64) -> MetadataResult<Option<ResourceCacheRow>> {
        let row = sqlx::query_as::<_, ResourceCacheRow>(
            "SELECT id, resource_config_id, version, params_hash FROM resource_caches WHERE id = $1",
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
             FROM resource_configs WHERE id = $1",
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
             FROM resource_cache_uses WHERE resource_cache_id = $1",
        )
        .bind(cache_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_resource_cache_uses(&self, cache_id: i64) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM resource_cache_uses WHERE resource_cache_id = $1",
        )
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
impl ResourceCacheGcRepo for PostgresStore {
    async fn clean_uses_for_finished_builds(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM resource_cache_uses rcu
            USING builds b
            WHERE rcu.build_id = b.id
              AND (
                b.status IN ($1, $2)
                OR (b.status = $3 AND b.id NOT IN (
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
            "DELETE FROM resource_cache_uses rcu
             USING resource_types t
             WHERE rcu.resource_type_id = t.id AND NOT t.active",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn clean_uses_for_inactive_resources(&self) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM resource_cache_uses rcu
             USING resources r
             WHERE rcu.resource_id = r.id AND NOT r.active",
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

// Caches locked by an in-flight find-or-create are left for the next sweep.
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
    WHERE rc.params_hash = $1 AND rc.version = irv.version
    UNION
    SELECT rc.id
    FROM next_build_inputs nbi
    INNER JOIN versioned_resources vr ON vr.id = nbi.version_id
    INNER JOIN resources r ON r.id = vr.resource_id
    INNER JOIN resource_caches rc ON rc.version = vr.version
    INNER JOIN resource_configs rf ON rf.id = rc.resource_config_id
    WHERE r.active AND r.source_hash = rf.source_hash
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
DELETE FROM resource_caches
WHERE id IN (
    SELECT id FROM resource_caches
    WHERE id NOT IN (SELECT id FROM protected)
    FOR UPDATE SKIP LOCKED
)
"#;

#[cfg(test)]
mod tests {
    use super::{POSTGRES_SCHEMA, postgres_schema_statements};

    #[test]
    fn postgres_schema_statements_skips_empty_and_comment_only() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn embedded_schema_creates_every_cache_table() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        for table in [
            "base_resource_types",
            "resource_configs",
            "resource_caches",
            "resource_cache_uses",
            "resource_config_uses",
        ] {
            let create = format!("CREATE TABLE IF NOT EXISTS {table} (");
            assert!(
                statements.iter().any(|s| s.contains(&create)),
                "missing table {table}"
            );
        }
    }
}
