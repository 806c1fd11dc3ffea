//! Periodic reclamation of resource caches.
//!
//! A [`Reaper`] runs the garbage collection sweeps in order on a fixed
//! interval. Each sweep is bounded by a timeout; a sweep that times out is
//! dropped, which rolls back its transaction, and the cycle is abandoned
//! until the next tick.

use anyhow::{Context, Result, anyhow};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use rescache_core::config::{AppConfig, GcConfig};
use rescache_metadata::{GcStats, GcSweep, ResourceCacheFactory};
use std::future::Future;
use std::path::Path;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "RESCACHE_";

/// Load configuration from an optional TOML file, overridden by
/// `RESCACHE_`-prefixed environment variables (`__` separates nested keys).
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Milliseconds from `start` to `end`, clamped at zero if the wall clock
/// stepped backwards.
fn elapsed_ms(start: OffsetDateTime, end: OffsetDateTime) -> u64 {
    u64::try_from((end - start).whole_milliseconds()).unwrap_or(0)
}

/// Drives garbage collection cycles against a metadata store.
pub struct Reaper {
    factory: ResourceCacheFactory,
    config: GcConfig,
}

impl Reaper {
    pub fn new(factory: ResourceCacheFactory, config: GcConfig) -> Self {
        Self { factory, config }
    }

    /// Run every sweep once, in order.
    ///
    /// Stops at the first sweep that fails or times out. Sweeps that already
    /// committed stay committed.
    pub async fn run_cycle(&self) -> Result<GcStats> {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("gc_cycle", %cycle_id);

        async {
            let started_at = OffsetDateTime::now_utc();
            let timeout = self.config.sweep_timeout();
            let mut stats = GcStats::default();

            for sweep in GcSweep::ALL {
                let deleted = tokio::time::timeout(timeout, self.factory.run_sweep(sweep))
                    .await
                    .map_err(|_| {
                        anyhow!(
                            "GC sweep {} timed out after {}s",
                            sweep.as_str(),
                            timeout.as_secs()
                        )
                    })?
                    .with_context(|| format!("GC sweep {} failed", sweep.as_str()))?;
                stats.record(sweep, deleted);
            }

            tracing::info!(
                started_at = %started_at,
                elapsed_ms = elapsed_ms(started_at, OffsetDateTime::now_utc()),
                uses_deleted = stats.uses_deleted(),
                caches_deleted = stats.invalid_caches,
                "GC cycle complete"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    /// Run cycles on the configured interval until `shutdown` resolves.
    ///
    /// A failed cycle is logged and retried on the next tick.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_start {
            // The first tick completes immediately.
            ticker.tick().await;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            sweep_timeout_secs = self.config.sweep_timeout_secs,
            run_on_start = self.config.run_on_start,
            "GC reaper started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("GC reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(stats) => {
                            if let Ok(json) = serde_json::to_string(&stats) {
                                tracing::debug!(stats = %json, "GC cycle stats");
                            }
                        }
                        Err(e) => tracing::error!(error = ?e, "GC cycle failed"),
                    }
                }
            }
        }
    }
}
