//! Concurrent key-value cache store with TTL freshness tracking.
//!
//! The store is a `DashMap` keyed by the canonical string form of
//! [`CacheKey`]. Reads never block on I/O and never fail; staleness is
//! derived lazily at read time. Writes replace the whole entry under the
//! per-shard lock, so there is never more than one entry per key and no
//! torn values.
//!
//! Every write stamps the entry with a store-wide monotonic version, and
//! every invalidation bumps a per-key epoch that survives entry removal.
//! Versions let a rollback detect that a newer write landed after the
//! optimistic update it is undoing; epochs let an in-flight fetch detect
//! that its key was invalidated while the network call was running.
//!
//! The store owns the subscription registry. Callbacks run synchronously on
//! the mutating call, never across an await point, and must not call back
//! into the store's write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::entry::{
    CacheEntry, CachedValue, ChangeEvent, ChangeKind, EntryState, StateMarker, UndoRecord,
};
use crate::error::{SyncError, SyncResult};
use crate::key::{CacheKey, KeyPattern, WILDCARD};
use crate::stats::StatsCollector;

/// Callback invoked on entry transitions.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// What a subscription listens to.
#[derive(Debug, Clone)]
pub enum SubscriptionMatcher {
    Exact(String),
    Pattern(KeyPattern),
}

impl SubscriptionMatcher {
    /// An input containing a wildcard segment subscribes to a pattern,
    /// anything else to an exact key.
    pub fn parse(key_or_pattern: &str) -> SyncResult<Self> {
        if key_or_pattern.split(crate::key::KEY_SEPARATOR).any(|s| s == WILDCARD) {
            Ok(Self::Pattern(KeyPattern::parse(key_or_pattern)))
        } else {
            Ok(Self::Exact(CacheKey::parse(key_or_pattern)?.as_str().to_owned()))
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Pattern(pattern) => pattern.matches(key),
        }
    }
}

/// Handle returned by [`CacheStore::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    matcher: SubscriptionMatcher,
    callback: ChangeCallback,
}

/// Shared, concurrent cache store. One instance per client; coordinators
/// hold it by `Arc` rather than through any ambient global.
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    /// Per-key invalidation epochs; retained after entry removal.
    epochs: DashMap<String, u64>,
    subscriptions: DashMap<u64, Subscription>,
    next_version: AtomicU64,
    next_subscription: AtomicU64,
    max_entries: usize,
    stats: StatsCollector,
}

impl CacheStore {
    pub fn new(max_entries: usize, stats: StatsCollector) -> Self {
        Self {
            entries: DashMap::new(),
            epochs: DashMap::new(),
            subscriptions: DashMap::new(),
            next_version: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
            max_entries: max_entries.max(1),
            stats,
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Non-blocking read. Returns an owned copy of the value plus the state
    /// computed at read time; absent keys return `None`, never an error.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        self.entries.get(key.as_str()).map(|entry| CachedValue {
            value: entry.value.clone(),
            state: entry.state(),
            version: entry.version,
        })
    }

    /// `true` when the entry exists and is within its TTL.
    pub fn is_fresh(&self, key: &CacheKey) -> bool {
        self.get(key)
            .map(|cached| cached.state == EntryState::Fresh)
            .unwrap_or(false)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the entry for `key` atomically. Last writer wins; returns the
    /// version stamped on the new entry.
    pub fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> u64 {
        let version = self.bump_version();
        let kind = match self.entries.entry(key.as_str().to_owned()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(CacheEntry::new(value, ttl, version));
                ChangeKind::Updated
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl, version));
                ChangeKind::Created
            }
        };
        debug!(key = %key, version, ttl_ms = ttl.as_millis() as u64, "Cache store");
        self.enforce_limits();
        self.notify(ChangeEvent::new(key.as_str(), kind, EntryState::Fresh));
        version
    }

    /// Apply an optimistic update: snapshot the prior entry, then write the
    /// value computed from it with state `Optimistic`.
    ///
    /// The returned [`UndoRecord`] restores the snapshot on rollback. The
    /// closure runs under the key's shard lock and must not call back into
    /// the store.
    pub fn set_optimistic(
        &self,
        key: &CacheKey,
        apply: impl FnOnce(Option<&Value>) -> Value,
        ttl: Duration,
    ) -> UndoRecord {
        let version = self.bump_version();
        let (undo, kind) = match self.entries.entry(key.as_str().to_owned()) {
            Entry::Occupied(mut occupied) => {
                let prior = occupied.get().clone();
                let next = apply(Some(&prior.value));
                occupied.insert(CacheEntry::optimistic(next, ttl, version));
                (
                    UndoRecord {
                        key: key.as_str().to_owned(),
                        prior: Some(prior),
                        optimistic_version: version,
                    },
                    ChangeKind::Updated,
                )
            }
            Entry::Vacant(vacant) => {
                let next = apply(None);
                vacant.insert(CacheEntry::optimistic(next, ttl, version));
                (
                    UndoRecord {
                        key: key.as_str().to_owned(),
                        prior: None,
                        optimistic_version: version,
                    },
                    ChangeKind::Created,
                )
            }
        };
        debug!(key = %key, version, "Optimistic write");
        self.stats.record_optimistic_apply();
        self.notify(ChangeEvent::new(key.as_str(), kind, EntryState::Optimistic));
        undo
    }

    /// Settle an optimistic entry as confirmed: keep its value and TTL,
    /// restart the freshness clock and clear the optimistic marker.
    ///
    /// Returns `false` without touching the entry when `expected_version` no
    /// longer matches, i.e. a newer write already replaced the optimistic
    /// one.
    pub fn confirm(&self, key: &CacheKey, expected_version: u64) -> bool {
        let version = self.bump_version();
        let confirmed = match self.entries.entry(key.as_str().to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected_version {
                    false
                } else {
                    let confirmed = CacheEntry::new(
                        occupied.get().value.clone(),
                        occupied.get().ttl,
                        version,
                    );
                    occupied.insert(confirmed);
                    true
                }
            }
            Entry::Vacant(_) => false,
        };
        if confirmed {
            debug!(key = %key, "Optimistic entry confirmed");
            self.notify(ChangeEvent::new(
                key.as_str(),
                ChangeKind::Updated,
                EntryState::Fresh,
            ));
        } else {
            debug!(key = %key, "Confirm skipped, entry changed since optimistic write");
        }
        confirmed
    }

    /// Undo an optimistic update by restoring its prior snapshot.
    ///
    /// Returns `Ok(false)` when the entry no longer carries the optimistic
    /// version (a newer write or an invalidation won; nothing is touched).
    /// An entry that matches the version but is not optimistic means the
    /// undo bookkeeping is inconsistent; that is a [`SyncError::Rollback`]
    /// and the caller must invalidate the key.
    pub fn rollback(&self, undo: UndoRecord) -> SyncResult<bool> {
        let UndoRecord {
            key,
            prior,
            optimistic_version,
        } = undo;
        enum Outcome {
            Restored(EntryState),
            Removed,
            Skipped,
            Inconsistent,
        }
        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != optimistic_version {
                    Outcome::Skipped
                } else if occupied.get().marker != StateMarker::Optimistic {
                    Outcome::Inconsistent
                } else {
                    match prior {
                        Some(mut restored) => {
                            restored.version = self.bump_version();
                            let state = restored.state();
                            occupied.insert(restored);
                            Outcome::Restored(state)
                        }
                        None => {
                            occupied.remove();
                            Outcome::Removed
                        }
                    }
                }
            }
            Entry::Vacant(_) => Outcome::Skipped,
        };
        match outcome {
            Outcome::Restored(state) => {
                debug!(key = %key, "Rolled back to prior entry");
                self.stats.record_rollback();
                self.notify(ChangeEvent::new(&key, ChangeKind::Updated, state));
                Ok(true)
            }
            Outcome::Removed => {
                debug!(key = %key, "Rolled back optimistic insert");
                self.stats.record_rollback();
                self.bump_epoch(&key);
                self.notify(ChangeEvent::new(
                    &key,
                    ChangeKind::Invalidated,
                    EntryState::Invalidated,
                ));
                Ok(true)
            }
            Outcome::Skipped => {
                debug!(key = %key, "Rollback skipped, a newer write won");
                Ok(false)
            }
            Outcome::Inconsistent => {
                error!(key = %key, "Rollback found a non-optimistic entry at the optimistic version");
                Err(SyncError::Rollback {
                    key,
                    reason: "entry at the optimistic version is not optimistic".into(),
                })
            }
        }
    }

    /// Remove a single entry. Returns whether anything was removed.
    pub fn delete(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key.as_str()).is_some();
        if removed {
            self.bump_epoch(key.as_str());
            self.stats.record_invalidated(1);
            self.notify(ChangeEvent::new(
                key.as_str(),
                ChangeKind::Invalidated,
                EntryState::Invalidated,
            ));
        }
        removed
    }

    /// Remove every entry matching the pattern. Returns the count removed.
    /// The empty pattern matches nothing.
    pub fn delete_by_pattern(&self, pattern: &KeyPattern) -> usize {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if self.entries.remove(&key).is_some() {
                self.bump_epoch(&key);
                self.notify(ChangeEvent::new(
                    &key,
                    ChangeKind::Invalidated,
                    EntryState::Invalidated,
                ));
                removed += 1;
            }
        }
        if removed > 0 {
            self.stats.record_invalidated(removed as u64);
        }
        debug!(pattern = %pattern, removed, "Pattern invalidation");
        removed
    }

    /// Mark an entry `Invalidated` in place instead of removing it. Used
    /// when the cached bytes may still be useful for display but must not be
    /// trusted, e.g. after a failed rollback.
    pub fn mark_invalidated(&self, key: &CacheKey) -> bool {
        let marked = match self.entries.get_mut(key.as_str()) {
            Some(mut entry) => {
                entry.marker = StateMarker::Invalidated;
                entry.version = self.bump_version();
                true
            }
            None => false,
        };
        if marked {
            self.bump_epoch(key.as_str());
            self.stats.record_invalidated(1);
            self.notify(ChangeEvent::new(
                key.as_str(),
                ChangeKind::Invalidated,
                EntryState::Invalidated,
            ));
        }
        marked
    }

    /// Remove everything. Returns the count removed.
    pub fn clear(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                self.bump_epoch(&key);
                self.notify(ChangeEvent::new(
                    &key,
                    ChangeKind::Invalidated,
                    EntryState::Invalidated,
                ));
                removed += 1;
            }
        }
        if removed > 0 {
            self.stats.record_invalidated(removed as u64);
            warn!(cleared_entries = removed, "Cache cleared");
        }
        removed
    }

    /// Current invalidation epoch for a key. Bumped by every removal or
    /// invalidation, never by a plain write, and retained after the entry is
    /// gone.
    pub(crate) fn epoch(&self, key: &CacheKey) -> u64 {
        self.epochs.get(key.as_str()).map(|e| *e).unwrap_or(0)
    }

    fn bump_epoch(&self, key: &str) {
        *self.epochs.entry(key.to_owned()).or_insert(0) += 1;
    }

    /// Register a callback for transitions on a key or pattern. The
    /// subscription lives until explicitly removed; leaking it is the
    /// caller's bug, not the store's.
    pub fn subscribe(
        &self,
        matcher: SubscriptionMatcher,
        callback: ChangeCallback,
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, Subscription { matcher, callback });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id.0).is_some()
    }

    fn notify(&self, event: ChangeEvent) {
        // Collect first so no shard lock is held while callbacks run.
        let callbacks: Vec<ChangeCallback> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.matcher.matches(&event.key))
            .map(|sub| sub.callback.clone())
            .collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Evict ~10% of the oldest entries once the entry bound is exceeded.
    /// Optimistic entries are awaiting settlement and are skipped.
    fn enforce_limits(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut candidates: Vec<(String, std::time::Instant)> = self
            .entries
            .iter()
            .filter(|entry| entry.marker != StateMarker::Optimistic)
            .map(|entry| (entry.key().clone(), entry.stored_at))
            .collect();
        candidates.sort_by_key(|(_, stored_at)| *stored_at);

        let evict_count = (self.entries.len() / 10).max(1);
        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(evict_count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        warn!(
            evicted,
            max_entries = self.max_entries,
            "Cache entry limit exceeded, evicted oldest entries"
        );
    }

    /// Remove entries expired for longer than `grace`. Memory bounding only;
    /// staleness itself is always derived lazily on read.
    pub fn sweep_expired(&self, grace: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.sweepable(grace));
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!(swept, "Swept expired cache entries");
        }
        swept
    }
}
