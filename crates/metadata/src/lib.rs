//! Resource cache bookkeeping for the pipeline orchestrator.
//!
//! This crate owns the cache data model:
//! - Resolution of custom resource type chains into resource configs
//! - Find-or-create of configs and caches, deduplicated under concurrency
//! - Usage tracking by builds, resources and resource types
//! - Garbage collection sweeps over uses and unreachable caches

pub mod error;
pub mod factory;
pub mod identity;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod resolver;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use factory::ResourceCacheFactory;
pub use identity::{CacheOwner, CacheUser, ResourceCacheRequest};
pub use models::UsedResourceCache;
pub use postgres::PostgresStore;
pub use repos::{GcStats, GcSweep};
pub use store::{MetadataStore, SqliteStore};

use rescache_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate()?;

    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
