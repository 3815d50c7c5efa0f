use std::sync::Arc;

use async_trait::async_trait;

use crate::model::*;
use crate::ratelimit::{CounterOutcome, CounterStore, next_counter};

use super::{Engine, EngineError, SharedCounter};

impl Engine {
    /// Current slot for `key`, created empty if missing.
    fn counter_slot(&self, key: &str) -> SharedCounter {
        self.counters.entry(key.to_string()).or_default().value().clone()
    }

    fn is_current_slot(&self, key: &str, slot: &SharedCounter) -> bool {
        self.counters
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    pub fn counter(&self, key: &str) -> Option<RateLimitCounter> {
        let slot = self.counters.get(key)?.value().clone();
        slot.try_lock().ok().and_then(|guard| guard.clone())
    }

    /// Delete counters whose window started at least `ttl_ms` before `now`.
    pub async fn sweep_counters(&self, now: Ms, ttl_ms: Ms) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let slots: Vec<(String, SharedCounter)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut swept = 0;
        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            let stale = match guard.as_ref() {
                Some(counter) => now - counter.window_start >= ttl_ms,
                None => true,
            };
            if !stale || !self.is_current_slot(&key, &slot) {
                continue;
            }
            if guard.is_some() {
                self.wal_append(&Event::CounterSwept { key: key.clone() }).await?;
                swept += 1;
            }
            *guard = None;
            self.counters.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        }
        if swept > 0 {
            tracing::info!(swept, "swept stale rate-limit counters");
        }
        Ok(swept)
    }
}

#[async_trait]
impl CounterStore for Engine {
    /// Fixed-window increment, atomic per key: the read-modify-write happens
    /// under the key's mutex and the new row is durable before it is visible.
    async fn hit(
        &self,
        key: &str,
        now: Ms,
        max_requests: u32,
        window_ms: Ms,
    ) -> Result<CounterOutcome, EngineError> {
        let _gate = self.compaction_gate.read().await;
        loop {
            let slot = self.counter_slot(key);
            let mut guard = slot.lock().await;
            if !self.is_current_slot(key, &slot) {
                // Swept while we waited.
                continue;
            }
            let (outcome, next) = next_counter(guard.as_ref(), key, now, max_requests, window_ms);
            if let Some(counter) = next {
                self.wal_append(&Event::CounterUpdated { counter: counter.clone() })
                    .await?;
                *guard = Some(counter);
            }
            return Ok(outcome);
        }
    }
}
