use std::sync::Arc;
use std::time::Duration;

use chrono::Days;
use tracing::info;

use crate::engine::Engine;
use crate::model::{Actor, Ms};

/// One sweep: purge availability older than `stale_after_days` and drop
/// rate-limit counters idle for `counter_ttl_ms`.
pub async fn sweep_once(engine: &Engine, now: Ms, stale_after_days: u32, counter_ttl_ms: Ms) {
    let today = engine.config.zone.normalize_to_midnight(now);
    if let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(stale_after_days))) {
        match engine.purge_stale_availability(&Actor::admin(), cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, %cutoff, "sweeper purged stale availability"),
            Err(e) => tracing::warn!("availability purge failed: {e}"),
        }
    }
    if let Err(e) = engine.sweep_counters(now, counter_ttl_ms).await {
        tracing::warn!("counter sweep failed: {e}");
    }
    metrics::gauge!(crate::observability::CAREGIVERS_REGISTERED).set(engine.caregiver_count() as f64);
}

/// Background task running `sweep_once` every `interval`.
pub async fn run_sweeper(engine: Arc<Engine>, interval: Duration, stale_after_days: u32, counter_ttl_ms: Ms) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = crate::engine::now_ms();
        sweep_once(&engine, now, stale_after_days, counter_ttl_ms).await;
    }
}

/// Background task compacting the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
