//! PostgreSQL-specific integration tests using testcontainers.
//!
//! They require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::fixtures::{source, version};
use common::postgres_or_skip;
use rescache_core::{BuildStatus, ResourceTypes};
use rescache_metadata::MetadataStore;

#[tokio::test]
async fn test_postgres_migrate_is_idempotent() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };

    metadata.postgres_store().migrate().await.unwrap();
    metadata.postgres_store().migrate().await.unwrap();
    metadata.postgres_store().health_check().await.unwrap();

    let fks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_constraint WHERE conname = 'resource_configs_resource_cache_id_fkey'",
    )
    .fetch_one(metadata.postgres_store().pool())
    .await
    .unwrap();
    assert_eq!(fks, 1);
}

#[tokio::test]
async fn test_postgres_used_cache_cannot_be_deleted() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let db = metadata.db();
    let pipeline = db.seed.pipeline("main").await;
    let build = db.seed.build(None, BuildStatus::Started).await;

    let used = db
        .factory
        .find_or_create_for_build(
            &build,
            "git",
            &version("v1"),
            &source("a"),
            None,
            &pipeline,
            &ResourceTypes::default(),
        )
        .await
        .unwrap();

    let result = sqlx::query("DELETE FROM resource_caches WHERE id = $1")
        .bind(used.id)
        .execute(metadata.postgres_store().pool())
        .await;
    assert!(result.is_err(), "deleting a used cache must fail");
    assert_eq!(db.store().count_resource_caches().await.unwrap(), 1);
}

#[tokio::test]
async fn test_postgres_rejects_use_with_two_owners() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let db = metadata.db();
    let pipeline = db.seed.pipeline("main").await;
    let build = db.seed.build(None, BuildStatus::Started).await;
    let resource = db.seed.resource(&pipeline, "repo", &source("a")).await;

    let used = db
        .factory
        .find_or_create_for_build(
            &build,
            "git",
            &version("v1"),
            &source("a"),
            None,
            &pipeline,
            &ResourceTypes::default(),
        )
        .await
        .unwrap();

    let result = sqlx::query(
        "INSERT INTO resource_cache_uses (resource_cache_id, build_id, resource_id) VALUES ($1, $2, $3)",
    )
    .bind(used.id)
    .bind(build.id)
    .bind(resource.id)
    .execute(metadata.postgres_store().pool())
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_postgres_sweep_skips_cache_held_by_find_or_create() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let db = metadata.db();
    let pipeline = db.seed.pipeline("main").await;
    let first = db.seed.build(None, BuildStatus::Started).await;
    let second = db.seed.build(None, BuildStatus::Started).await;

    let cache = db
        .factory
        .find_or_create_for_build(
            &first,
            "git",
            &version("v1"),
            &source("a"),
            None,
            &pipeline,
            &ResourceTypes::default(),
        )
        .await
        .unwrap();
    db.seed.delete_cache_uses(cache.id).await;

    // Reuse of the unprotected cache, still open while the sweep runs.
    let pool = metadata.postgres_store().pool();
    let mut reuse = pool.begin().await.unwrap();
    let locked: i64 = sqlx::query_scalar("SELECT id FROM resource_caches WHERE id = $1 FOR SHARE")
        .bind(cache.id)
        .fetch_one(&mut *reuse)
        .await
        .unwrap();
    assert_eq!(locked, cache.id);

    let deleted = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        db.factory.clean_up_invalid_caches(),
    )
    .await
    .expect("sweep must not wait on a shared lock")
    .unwrap();
    assert_eq!(deleted, 0);

    sqlx::query("INSERT INTO resource_cache_uses (resource_cache_id, build_id) VALUES ($1, $2)")
        .bind(cache.id)
        .bind(second.id)
        .execute(&mut *reuse)
        .await
        .unwrap();
    reuse.commit().await.unwrap();

    assert_eq!(db.factory.clean_up_invalid_caches().await.unwrap(), 0);
    assert_eq!(db.store().count_resource_cache_uses(cache.id).await.unwrap(), 1);

    db.seed.delete_cache_uses(cache.id).await;
    assert_eq!(db.factory.clean_up_invalid_caches().await.unwrap(), 1);
    assert_eq!(db.store().count_resource_caches().await.unwrap(), 0);
}
