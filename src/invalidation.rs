//! Pattern-based bulk invalidation over the cache store.
//!
//! The engine evaluates patterns, it does not store them: callers own their
//! patterns and the engine holds no reference to them after the call.
//! Matching semantics live in [`KeyPattern`]; removal and `Invalidated`
//! notifications are delegated to the store.

use std::sync::Arc;

use tracing::{debug, info};

use crate::key::{CacheKey, KeyPattern};
use crate::store::CacheStore;

pub struct InvalidationEngine {
    store: Arc<CacheStore>,
}

impl InvalidationEngine {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Remove every cached entry matching the pattern and notify matching
    /// subscriptions with `Invalidated`. Returns the count removed.
    ///
    /// The empty pattern matches nothing, and a pattern without wildcards
    /// behaves as an exact-key delete.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let removed = self.store.delete_by_pattern(pattern);
        debug!(pattern = %pattern, removed, "Invalidated by pattern");
        removed
    }

    /// Exact-key invalidation.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.store.delete(key)
    }

    /// Invalidate a batch of exact keys. Returns the count removed.
    pub fn invalidate_batch(&self, keys: &[CacheKey]) -> usize {
        keys.iter().filter(|key| self.store.delete(key)).count()
    }

    /// Drop the entire cache.
    pub fn clear_all(&self) -> usize {
        let removed = self.store.clear();
        info!(removed, "Cache cleared via invalidation engine");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsCollector;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<CacheStore>, InvalidationEngine) {
        let store = Arc::new(CacheStore::new(10_000, StatsCollector::new()));
        let engine = InvalidationEngine::new(store.clone());
        (store, engine)
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    #[test]
    fn test_pattern_invalidation_is_scoped() {
        let (store, engine) = setup();
        for k in ["chat:1:messages:0", "chat:1:messages:1", "chat:2:messages:0"] {
            store.set(&key(k), json!([]), Duration::from_secs(30));
        }

        assert_eq!(engine.invalidate(&KeyPattern::parse("chat:1:messages:*")), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(&key("chat:2:messages:0")).is_some());
    }

    #[test]
    fn test_exact_pattern_deletes_one_key() {
        let (store, engine) = setup();
        store.set(&key("user:1"), json!(1), Duration::from_secs(30));
        store.set(&key("user:12"), json!(2), Duration::from_secs(30));

        assert_eq!(engine.invalidate(&KeyPattern::parse("user:1")), 1);
        assert!(store.get(&key("user:12")).is_some());
    }

    #[test]
    fn test_empty_pattern_is_not_a_full_wipe() {
        let (store, engine) = setup();
        store.set(&key("user:1"), json!(1), Duration::from_secs(30));

        assert_eq!(engine.invalidate(&KeyPattern::parse("")), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_batch_invalidation() {
        let (store, engine) = setup();
        for k in ["user:1", "user:2", "user:3"] {
            store.set(&key(k), json!(1), Duration::from_secs(30));
        }

        let removed = engine.invalidate_batch(&[key("user:1"), key("user:3"), key("user:9")]);
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear_all() {
        let (store, engine) = setup();
        store.set(&key("user:1"), json!(1), Duration::from_secs(30));
        store.set(&key("feed:home"), json!([]), Duration::from_secs(30));

        assert_eq!(engine.clear_all(), 2);
        assert!(store.is_empty());
    }
}
