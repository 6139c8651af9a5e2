/// Configuration for the sync client.
///
/// Loads from environment variables with per-field fallbacks; unparseable
/// values fall back to their defaults.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryOptions;

/// Tunables for a [`crate::SyncClient`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between background sync queue flushes.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Interval between expired-entry sweeps of the cache store.
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Upper bound on queued mutation intents.
    pub max_queue_len: usize,
    /// Upper bound on cache entries before oldest-first eviction.
    pub max_entries: usize,
    /// TTL applied when a query populates the store without an explicit
    /// stale time. Domain-specific TTLs belong to callers, not the store.
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,
    /// Retry policy applied to queries without an explicit one, and backoff
    /// shape for queued mutation retries.
    #[serde(skip)]
    pub default_retry: RetryOptions,
    /// Initial connectivity assumption.
    pub start_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            max_queue_len: 256,
            max_entries: 10_000,
            default_ttl: Duration::from_secs(30),
            default_retry: RetryOptions::default(),
            start_online: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `CACHE_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            flush_interval: env_millis("CACHE_SYNC_FLUSH_INTERVAL_MS", defaults.flush_interval),
            sweep_interval: env_millis("CACHE_SYNC_SWEEP_INTERVAL_MS", defaults.sweep_interval),
            max_queue_len: env_parse("CACHE_SYNC_MAX_QUEUE_LEN", defaults.max_queue_len),
            max_entries: env_parse("CACHE_SYNC_MAX_ENTRIES", defaults.max_entries),
            default_ttl: env_millis("CACHE_SYNC_DEFAULT_TTL_MS", defaults.default_ttl),
            default_retry: defaults.default_retry,
            start_online: env_parse("CACHE_SYNC_START_ONLINE", defaults.start_online),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.max_queue_len, 256);
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.default_ttl, Duration::from_secs(30));
        assert!(config.start_online);
    }

    #[test]
    fn test_env_overrides_and_fallbacks() {
        std::env::set_var("CACHE_SYNC_FLUSH_INTERVAL_MS", "250");
        std::env::set_var("CACHE_SYNC_MAX_QUEUE_LEN", "not-a-number");

        let config = SyncConfig::from_env();
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        // Unparseable value falls back to the default.
        assert_eq!(config.max_queue_len, 256);

        std::env::remove_var("CACHE_SYNC_FLUSH_INTERVAL_MS");
        std::env::remove_var("CACHE_SYNC_MAX_QUEUE_LEN");
    }
}
