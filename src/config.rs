use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::calendar::ReferenceZone;
use crate::engine::{EngineConfig, SlotPolicy};
use crate::limits::MAX_HORIZON_DAYS;
use crate::ratelimit::{RateLimitPolicy, default_presets};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineConfig,
    pub stale_after_days: u32,
    pub counter_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub rate_limits: HashMap<String, RateLimitPolicy>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Missing values take defaults;
    /// present but malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let offset_minutes: i32 = parse_or(&get, "CAREBOOK_UTC_OFFSET_MINUTES", 0)?;
        let zone = ReferenceZone::from_offset_minutes(offset_minutes).ok_or_else(|| ConfigError {
            var: "CAREBOOK_UTC_OFFSET_MINUTES",
            message: format!("{offset_minutes} is not a valid UTC offset"),
        })?;
        let horizon_days: u32 = parse_or(&get, "CAREBOOK_HORIZON_DAYS", 90)?;
        if horizon_days > MAX_HORIZON_DAYS {
            return Err(ConfigError {
                var: "CAREBOOK_HORIZON_DAYS",
                message: format!("at most {MAX_HORIZON_DAYS} days"),
            });
        }
        let slot_policy: SlotPolicy = parse_or(&get, "CAREBOOK_SLOT_POLICY", SlotPolicy::WholeSlot)?;

        let tls_cert = get("CAREBOOK_TLS_CERT");
        let tls_key = get("CAREBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError {
                var: "CAREBOOK_TLS_CERT",
                message: "CAREBOOK_TLS_CERT and CAREBOOK_TLS_KEY must be set together".into(),
            });
        }

        let mut rate_limits = default_presets();
        if let Some(raw) = get("CAREBOOK_RATE_LIMITS") {
            rate_limits.extend(parse_rate_limits(&raw)?);
        }

        // Sweeping a counter inside its window would reset the quota early.
        let counter_ttl_secs: u64 = parse_or(&get, "CAREBOOK_COUNTER_TTL_SECS", 86_400)?;
        let longest_window_ms = rate_limits.values().map(|p| p.window_ms).max().unwrap_or(0);
        if (counter_ttl_secs as i128) * 1000 < i128::from(longest_window_ms) {
            return Err(ConfigError {
                var: "CAREBOOK_COUNTER_TTL_SECS",
                message: format!(
                    "{counter_ttl_secs}s is shorter than the longest rate-limit window ({}s)",
                    longest_window_ms / 1000
                ),
            });
        }

        let max_connections: usize = parse_or(&get, "CAREBOOK_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError {
                var: "CAREBOOK_MAX_CONNECTIONS",
                message: "must be positive".into(),
            });
        }

        Ok(Self {
            bind: get("CAREBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "CAREBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(get("CAREBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("CAREBOOK_PASSWORD").unwrap_or_else(|| "carebook".into()),
            max_connections,
            compact_threshold: parse_or(&get, "CAREBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "CAREBOOK_METRICS_PORT")?,
            tls_cert,
            tls_key,
            engine: EngineConfig {
                zone,
                horizon_days,
                slot_policy,
            },
            stale_after_days: parse_or(&get, "CAREBOOK_STALE_AFTER_DAYS", 180)?,
            counter_ttl_secs,
            sweep_interval_secs: parse_or(&get, "CAREBOOK_SWEEP_INTERVAL_SECS", 300)?,
            rate_limits,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carebook.wal")
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError {
                var,
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_opt(get, var)?.unwrap_or(default))
}

/// `category=max/window_secs[/closed]`, comma separated.
pub fn parse_rate_limits(raw: &str) -> Result<HashMap<String, RateLimitPolicy>, ConfigError> {
    let bad = |message: String| ConfigError {
        var: "CAREBOOK_RATE_LIMITS",
        message,
    };
    let mut out = HashMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (category, rule) = item
            .split_once('=')
            .ok_or_else(|| bad(format!("{item:?}: expected category=max/window_secs")))?;
        let category = category.trim();
        if category.is_empty() {
            return Err(bad(format!("{item:?}: empty category")));
        }
        let mut parts = rule.trim().split('/');
        let max_requests: u32 = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad(format!("{item:?}: bad max requests")))?;
        let window_secs: i64 = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .filter(|w: &i64| *w > 0)
            .ok_or_else(|| bad(format!("{item:?}: bad window seconds")))?;
        let fail_open = match parts.next().map(str::trim) {
            None | Some("open") => true,
            Some("closed") => false,
            Some(other) => return Err(bad(format!("{item:?}: unknown mode {other:?}"))),
        };
        if parts.next().is_some() {
            return Err(bad(format!("{item:?}: too many fields")));
        }
        out.insert(
            category.to_string(),
            RateLimitPolicy {
                fail_open,
                ..RateLimitPolicy::per_window(max_requests, window_secs)
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.engine.horizon_days, 90);
        assert_eq!(cfg.engine.slot_policy, SlotPolicy::WholeSlot);
        assert_eq!(cfg.engine.zone, ReferenceZone::utc());
        assert_eq!(cfg.stale_after_days, 180);
        assert!(cfg.metrics_port.is_none());
        assert_eq!(cfg.rate_limits["booking"], RateLimitPolicy::per_window(20, 3600));
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/carebook.wal"));
    }

    #[test]
    fn overrides() {
        let cfg = from_pairs(&[
            ("CAREBOOK_PORT", "6543"),
            ("CAREBOOK_UTC_OFFSET_MINUTES", "540"),
            ("CAREBOOK_HORIZON_DAYS", "30"),
            ("CAREBOOK_SLOT_POLICY", "split"),
            ("CAREBOOK_METRICS_PORT", "9000"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6543);
        assert_eq!(cfg.engine.zone, ReferenceZone::from_offset_minutes(540).unwrap());
        assert_eq!(cfg.engine.horizon_days, 30);
        assert_eq!(cfg.engine.slot_policy, SlotPolicy::Split);
        assert_eq!(cfg.metrics_port, Some(9000));
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = from_pairs(&[("CAREBOOK_PORT", "lots")]).unwrap_err();
        assert_eq!(err.var, "CAREBOOK_PORT");
        assert!(from_pairs(&[("CAREBOOK_UTC_OFFSET_MINUTES", "100000")]).is_err());
        assert!(from_pairs(&[("CAREBOOK_SLOT_POLICY", "half")]).is_err());
        assert!(from_pairs(&[("CAREBOOK_HORIZON_DAYS", "5000")]).is_err());
        assert!(from_pairs(&[("CAREBOOK_TLS_CERT", "cert.pem")]).is_err());
        assert!(from_pairs(&[("CAREBOOK_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn counter_ttl_must_cover_every_window() {
        let err = from_pairs(&[("CAREBOOK_COUNTER_TTL_SECS", "600")]).unwrap_err();
        assert_eq!(err.var, "CAREBOOK_COUNTER_TTL_SECS");

        assert!(from_pairs(&[("CAREBOOK_COUNTER_TTL_SECS", "3600")]).is_ok());
        let longer = [
            ("CAREBOOK_COUNTER_TTL_SECS", "3600"),
            ("CAREBOOK_RATE_LIMITS", "booking=5/7200"),
        ];
        assert!(from_pairs(&longer).is_err());
    }

    #[test]
    fn rate_limit_presets_merge_over_defaults() {
        let cfg = from_pairs(&[("CAREBOOK_RATE_LIMITS", "booking=5/60, search=100/10/closed")]).unwrap();
        assert_eq!(cfg.rate_limits["booking"], RateLimitPolicy::per_window(5, 60));
        let search = cfg.rate_limits["search"];
        assert_eq!(search.max_requests, 100);
        assert_eq!(search.window_ms, 10_000);
        assert!(!search.fail_open);
        assert!(cfg.rate_limits.contains_key("profile"));
    }

    #[test]
    fn malformed_rate_limits_are_errors() {
        for bad in ["booking", "booking=5", "booking=x/60", "booking=5/0", "booking=5/60/maybe", "=5/60"] {
            assert!(parse_rate_limits(bad).is_err(), "{bad} should be rejected");
        }
    }
}
