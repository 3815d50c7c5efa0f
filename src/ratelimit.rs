//! Fixed-window request counter keyed by `category:identifier`.
//!
//! Counters live in a shared store so every stateless instance sees the same
//! count. A store failure fails open (or closed, per category) without retrying.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::engine::EngineError;
use crate::limits::MAX_RATE_KEY_LEN;
use crate::model::{Ms, RateLimitCounter};
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: Ms,
    /// Admit the request when the counter store cannot be reached.
    pub fail_open: bool,
}

impl RateLimitPolicy {
    pub const fn per_window(max_requests: u32, window_secs: i64) -> Self {
        Self {
            max_requests,
            window_ms: window_secs * 1000,
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Admitted { count: u32, window_start: Ms },
    Rejected { window_start: Ms },
}

impl CounterOutcome {
    fn verdict(self, policy: &RateLimitPolicy) -> Verdict {
        match self {
            CounterOutcome::Admitted { count, window_start } => Verdict {
                allowed: true,
                remaining: policy.max_requests.saturating_sub(count),
                reset_at: window_start + policy.window_ms,
            },
            CounterOutcome::Rejected { window_start } => Verdict {
                allowed: false,
                remaining: 0,
                reset_at: window_start + policy.window_ms,
            },
        }
    }
}

/// One fixed-window step. Returns the outcome and, when admitted, the row to store.
pub fn next_counter(
    existing: Option<&RateLimitCounter>,
    key: &str,
    now: Ms,
    max_requests: u32,
    window_ms: Ms,
) -> (CounterOutcome, Option<RateLimitCounter>) {
    let fresh = |count: u32| RateLimitCounter {
        key: key.to_string(),
        window_start: now,
        count,
    };
    if max_requests == 0 {
        let window_start = existing.map_or(now, |c| c.window_start);
        return (CounterOutcome::Rejected { window_start }, None);
    }
    match existing {
        None => (
            CounterOutcome::Admitted { count: 1, window_start: now },
            Some(fresh(1)),
        ),
        Some(c) if now - c.window_start >= window_ms => (
            CounterOutcome::Admitted { count: 1, window_start: now },
            Some(fresh(1)),
        ),
        Some(c) if c.count < max_requests => {
            let next = RateLimitCounter {
                key: c.key.clone(),
                window_start: c.window_start,
                count: c.count + 1,
            };
            (
                CounterOutcome::Admitted {
                    count: next.count,
                    window_start: next.window_start,
                },
                Some(next),
            )
        }
        Some(c) => (
            CounterOutcome::Rejected {
                window_start: c.window_start,
            },
            None,
        ),
    }
}

/// Shared persistent counter store. `hit` must be atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        now: Ms,
        max_requests: u32,
        window_ms: Ms,
    ) -> Result<CounterOutcome, EngineError>;
}

pub fn counter_key(category: &str, identifier: &str) -> String {
    format!("{category}:{identifier}")
}

pub fn default_presets() -> HashMap<String, RateLimitPolicy> {
    HashMap::from([
        ("availability".to_string(), RateLimitPolicy::per_window(60, 3600)),
        ("booking".to_string(), RateLimitPolicy::per_window(20, 3600)),
        ("cancellation".to_string(), RateLimitPolicy::per_window(10, 3600)),
        ("profile".to_string(), RateLimitPolicy::per_window(30, 3600)),
        ("login".to_string(), RateLimitPolicy::per_window(5, 900)),
    ])
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    presets: HashMap<String, RateLimitPolicy>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, presets: HashMap<String, RateLimitPolicy>) -> Self {
        Self { store, presets }
    }

    pub fn preset(&self, category: &str) -> Option<&RateLimitPolicy> {
        self.presets.get(category)
    }

    /// Count one request against `category:identifier`.
    pub async fn check(&self, category: &str, identifier: &str, policy: &RateLimitPolicy, now: Ms) -> Verdict {
        let key = counter_key(category, identifier);
        let verdict = match self
            .store
            .hit(&key, now, policy.max_requests, policy.window_ms)
            .await
        {
            Ok(outcome) => outcome.verdict(policy),
            Err(e) if policy.fail_open => {
                tracing::warn!(category, error = %e, "rate-limit store unavailable, failing open");
                metrics::counter!(observability::RATE_LIMIT_DECISIONS_TOTAL, "category" => category.to_string(), "decision" => "fail_open").increment(1);
                return Verdict {
                    allowed: true,
                    remaining: policy.max_requests.saturating_sub(1),
                    reset_at: now + policy.window_ms,
                };
            }
            Err(e) => {
                tracing::warn!(category, error = %e, "rate-limit store unavailable, failing closed");
                metrics::counter!(observability::RATE_LIMIT_DECISIONS_TOTAL, "category" => category.to_string(), "decision" => "fail_closed").increment(1);
                return Verdict {
                    allowed: false,
                    remaining: 0,
                    reset_at: now + policy.window_ms,
                };
            }
        };
        let decision = if verdict.allowed { "allowed" } else { "rejected" };
        metrics::counter!(observability::RATE_LIMIT_DECISIONS_TOTAL, "category" => category.to_string(), "decision" => decision).increment(1);
        verdict
    }

    /// Check against a configured preset.
    pub async fn check_preset(&self, category: &str, identifier: &str, now: Ms) -> Result<Verdict, EngineError> {
        let policy = *self
            .presets
            .get(category)
            .ok_or_else(|| EngineError::validation(format!("unknown rate-limit category: {category}")))?;
        if category.len() + identifier.len() + 1 > MAX_RATE_KEY_LEN {
            return Err(EngineError::LimitExceeded("rate-limit key too long"));
        }
        Ok(self.check(category, identifier, &policy, now).await)
    }

    /// Like `check_preset`, but a rejection is an error the caller can return directly.
    pub async fn enforce(&self, category: &str, identifier: &str, now: Ms) -> Result<Verdict, EngineError> {
        let verdict = self.check_preset(category, identifier, now).await?;
        if !verdict.allowed {
            return Err(EngineError::RateLimited {
                reset_at: verdict.reset_at,
            });
        }
        Ok(verdict)
    }
}
