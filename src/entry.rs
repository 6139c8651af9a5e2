//! Cache entries, entry states, undo records and change notifications.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Observable state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Within its TTL.
    Fresh,
    /// Past its TTL; a read may still serve it while a refetch runs.
    Stale,
    /// Written ahead of an unconfirmed remote operation.
    Optimistic,
    /// Explicitly invalidated; the next read must refetch.
    Invalidated,
}

/// Sticky marker stored on an entry. `Fresh`/`Stale` are derived lazily from
/// age, `Optimistic`/`Invalidated` override the derivation until settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateMarker {
    Plain,
    Optimistic,
    Invalidated,
}

/// A single cached value with its freshness metadata.
///
/// At most one entry exists per key; writes replace the whole entry and
/// stamp it with a store-wide monotonic version.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) value: Value,
    pub(crate) stored_at: Instant,
    pub(crate) ttl: Duration,
    pub(crate) marker: StateMarker,
    pub(crate) version: u64,
}

impl CacheEntry {
    pub(crate) fn new(value: Value, ttl: Duration, version: u64) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
            marker: StateMarker::Plain,
            version,
        }
    }

    pub(crate) fn optimistic(value: Value, ttl: Duration, version: u64) -> Self {
        Self {
            marker: StateMarker::Optimistic,
            ..Self::new(value, ttl, version)
        }
    }

    /// Staleness is derived on read; no background expiry is required.
    pub(crate) fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }

    pub(crate) fn state(&self) -> EntryState {
        match self.marker {
            StateMarker::Optimistic => EntryState::Optimistic,
            StateMarker::Invalidated => EntryState::Invalidated,
            StateMarker::Plain => {
                if self.is_expired() {
                    EntryState::Stale
                } else {
                    EntryState::Fresh
                }
            }
        }
    }

    /// Eligible for the periodic memory-bounding sweep. Optimistic entries
    /// are awaiting settlement and are never swept.
    pub(crate) fn sweepable(&self, grace: Duration) -> bool {
        self.marker != StateMarker::Optimistic && self.stored_at.elapsed() > self.ttl + grace
    }
}

/// Snapshot returned from a cache read: an owned copy of the value plus the
/// state computed at read time.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Value,
    pub state: EntryState,
    pub version: u64,
}

/// Undo data captured synchronously before an optimistic write.
///
/// Inert data rather than a rollback closure: the prior entry snapshot and
/// the version the optimistic write received. Rollback only applies while
/// the entry still carries that version, so a newer concurrent write is
/// never clobbered.
#[derive(Debug)]
pub struct UndoRecord {
    pub(crate) key: String,
    pub(crate) prior: Option<CacheEntry>,
    pub(crate) optimistic_version: u64,
}

impl UndoRecord {
    /// Canonical key this record restores.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Version stamped on the optimistic write this record undoes.
    pub fn optimistic_version(&self) -> u64 {
        self.optimistic_version
    }
}

/// Kind of entry transition delivered to subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Invalidated,
}

/// Notification delivered to matching subscriptions on every entry
/// transition.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
    pub state: EntryState,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub(crate) fn new(key: impl Into<String>, kind: ChangeKind, state: EntryState) -> Self {
        Self {
            key: key.into(),
            kind,
            state,
            at: Utc::now(),
        }
    }
}
