//! Preset policies for common data categories.
//!
//! TTLs are a caller concern: the cache store itself enforces no domain
//! defaults. These bundles encode the tuning the app's screens actually use
//! so call sites stay consistent.

use std::time::Duration;

use crate::query::QueryOptions;
use crate::retry::{Backoff, RetryOptions};

/// TTL policy for one category of cached data.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
}

impl CachePolicy {
    /// Live conversation data: 30s TTL.
    pub const LIVE_MESSAGES: Self = Self {
        ttl: Duration::from_secs(30),
    };

    /// Profile info changes rarely: 5 min TTL.
    pub const PROFILE: Self = Self {
        ttl: Duration::from_secs(300),
    };

    /// Search results: 60s TTL.
    pub const SEARCH: Self = Self {
        ttl: Duration::from_secs(60),
    };

    /// Real-time data that must never be served from cache.
    pub const REALTIME: Self = Self {
        ttl: Duration::from_secs(0),
    };
}

/// Interactive reads: short retry budget so the UI answers quickly, fail
/// soft onto stale data.
pub fn interactive_query(policy: CachePolicy) -> QueryOptions {
    QueryOptions {
        stale_time: policy.ttl,
        refetch_interval: None,
        retry: RetryOptions {
            max_attempts: 2,
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: true,
        },
        enabled: true,
    }
}

/// Background refresh traffic: patient exponential backoff and a periodic
/// refetch while the screen stays subscribed.
pub fn background_query(policy: CachePolicy, refetch_interval: Duration) -> QueryOptions {
    QueryOptions {
        stale_time: policy.ttl,
        refetch_interval: Some(refetch_interval),
        retry: RetryOptions {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        },
        enabled: true,
    }
}
