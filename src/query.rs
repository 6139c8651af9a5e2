//! Query coordinator: cache-first reads, fetch deduplication, bounded retry
//! and subscriber-counted background refresh.
//!
//! # Flow
//!
//! ```text
//! query(key)
//!   1. Fresh cached entry        -> return immediately, no network call
//!   2. Stale or absent           -> join the in-flight fetch for the key,
//!                                   or become its leader (exactly one
//!                                   fetcher call for N concurrent callers)
//!   3. Leader settles            -> populate the store (unless the key was
//!                                   invalidated in flight), resolve all
//!                                   waiters with the identical outcome
//!   4. Fetch failed              -> serve the stale value with the error
//!                                   attached instead of throwing
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::entry::EntryState;
use crate::error::{SyncError, SyncResult};
use crate::key::CacheKey;
use crate::retry::{with_retry, RetryOptions};
use crate::stats::StatsCollector;
use crate::store::CacheStore;

/// An opaque async data source for a query. The coordinator treats it as a
/// black box returning success or failure; timeouts are the fetcher's own
/// responsibility.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> SyncResult<Value>;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<Value>> + Send,
{
    async fn fetch(&self) -> SyncResult<Value> {
        (self)().await
    }
}

/// Per-query tuning.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// TTL stamped on the entry this query populates.
    pub stale_time: Duration,
    /// Re-run the fetch on this interval while at least one refresh
    /// subscriber is attached.
    pub refetch_interval: Option<Duration>,
    pub retry: RetryOptions,
    /// When `false`, `query` returns the last cached value without fetching.
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            refetch_interval: None,
            retry: RetryOptions::default(),
            enabled: true,
        }
    }
}

/// What a query hands back: always a well-defined value/error pair.
///
/// A failed fetch with a cached value degrades to `value: Some(stale)` plus
/// the error; only a cache-empty failure yields `value: None`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub value: Option<Value>,
    pub is_stale: bool,
    pub error: Option<SyncError>,
}

type FetchOutcome = SyncResult<Value>;

/// At most one of these exists per key; concurrent callers attach to it
/// instead of issuing duplicate network calls.
struct InFlight {
    rx: watch::Receiver<Option<FetchOutcome>>,
    waiters: Arc<AtomicUsize>,
}

struct Refresher {
    handle: JoinHandle<()>,
    subscribers: usize,
}

pub struct QueryCoordinator {
    store: Arc<CacheStore>,
    inflight: DashMap<String, InFlight>,
    refreshers: DashMap<String, Refresher>,
    stats: StatsCollector,
}

impl QueryCoordinator {
    pub fn new(store: Arc<CacheStore>, stats: StatsCollector) -> Self {
        Self {
            store,
            inflight: DashMap::new(),
            refreshers: DashMap::new(),
            stats,
        }
    }

    /// Cache-first read. Optimistic entries are served as-is; their fate is
    /// decided by the mutation that wrote them, not by a refetch.
    pub async fn query(
        &self,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> QueryResult {
        if !options.enabled {
            let cached = self.store.get(key);
            return QueryResult {
                is_stale: cached
                    .as_ref()
                    .map(|c| c.state == EntryState::Stale || c.state == EntryState::Invalidated)
                    .unwrap_or(false),
                value: cached.map(|c| c.value),
                error: None,
            };
        }

        if let Some(cached) = self.store.get(key) {
            if matches!(cached.state, EntryState::Fresh | EntryState::Optimistic) {
                self.stats.record_hit();
                debug!(key = %key, "Cache hit");
                return QueryResult {
                    value: Some(cached.value),
                    is_stale: false,
                    error: None,
                };
            }
        }
        self.stats.record_miss();
        debug!(key = %key, "Cache miss");

        self.fetch_shared(key, fetcher, options).await
    }

    /// Force a fetch, bypassing the freshness check. Deduplication still
    /// applies, so a refetch racing a regular query produces one call.
    pub async fn refetch(
        &self,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> QueryResult {
        self.fetch_shared(key, fetcher, options).await
    }

    async fn fetch_shared(
        &self,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> QueryResult {
        enum Role {
            Lead(watch::Sender<Option<FetchOutcome>>),
            Join(watch::Receiver<Option<FetchOutcome>>),
        }

        let role = match self.inflight.entry(key.as_str().to_owned()) {
            Entry::Occupied(occupied) => {
                occupied.get().waiters.fetch_add(1, Ordering::Relaxed);
                self.stats.record_dedup_join();
                debug!(key = %key, "Joining in-flight fetch");
                Role::Join(occupied.get().rx.clone())
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(InFlight {
                    rx,
                    waiters: Arc::new(AtomicUsize::new(1)),
                });
                Role::Lead(tx)
            }
        };

        let outcome = match role {
            Role::Lead(tx) => {
                // Removes the in-flight entry when the leader settles, and
                // also if the leading task is cancelled mid-fetch, so later
                // callers never join a dead channel.
                struct InflightGuard<'a> {
                    inflight: &'a DashMap<String, InFlight>,
                    key: &'a str,
                }
                impl Drop for InflightGuard<'_> {
                    fn drop(&mut self) {
                        self.inflight.remove(self.key);
                    }
                }
                let guard = InflightGuard {
                    inflight: &self.inflight,
                    key: key.as_str(),
                };

                let epoch = self.store.epoch(key);
                self.stats.record_fetch();
                let result = with_retry(&options.retry, || fetcher.fetch()).await;
                if let Ok(value) = &result {
                    if self.store.epoch(key) == epoch {
                        self.store.set(key, value.clone(), options.stale_time);
                    } else {
                        debug!(key = %key, "Discarding fetch result, key invalidated in flight");
                    }
                }
                // Remove before resolving so a caller arriving after
                // settlement starts a new fetch instead of observing a
                // finished channel.
                drop(guard);
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Join(mut rx) => match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(settled) => (*settled)
                    .clone()
                    .unwrap_or_else(|| Err(SyncError::fetch("fetch settled without an outcome"))),
                Err(_) => Err(SyncError::fetch("in-flight fetch abandoned")),
            },
        };

        self.resolve(key, outcome)
    }

    fn resolve(&self, key: &CacheKey, outcome: FetchOutcome) -> QueryResult {
        match outcome {
            Ok(value) => QueryResult {
                value: Some(value),
                is_stale: false,
                error: None,
            },
            Err(error) => {
                // Fail soft: degrade to whatever is cached and let the
                // caller decide how to present it.
                let cached = self.store.get(key);
                warn!(
                    key = %key,
                    error = %error,
                    stale_available = cached.is_some(),
                    "Query fetch failed"
                );
                QueryResult {
                    is_stale: cached.is_some(),
                    value: cached.map(|c| c.value),
                    error: Some(error),
                }
            }
        }
    }

    /// Attach a refresh subscriber for `key`. While at least one subscriber
    /// is attached and `options.refetch_interval` is set, the fetch is
    /// re-run on that interval regardless of read activity. The timer task
    /// is cancelled when the last guard detaches.
    pub fn subscribe_refresh(
        self: &Arc<Self>,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> RefreshGuard {
        let key_string = key.as_str().to_owned();
        let Some(period) = options.refetch_interval else {
            return RefreshGuard {
                queries: self.clone(),
                key: key_string,
                active: false,
            };
        };

        match self.refreshers.entry(key_string.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().subscribers += 1;
            }
            Entry::Vacant(vacant) => {
                debug!(key = %key, period_ms = period.as_millis() as u64, "Starting background refresh");
                let handle = tokio::spawn(Self::refresh_loop(
                    self.clone(),
                    key.clone(),
                    fetcher,
                    options,
                    period,
                ));
                vacant.insert(Refresher {
                    handle,
                    subscribers: 1,
                });
            }
        }

        RefreshGuard {
            queries: self.clone(),
            key: key_string,
            active: true,
        }
    }

    async fn refresh_loop(
        queries: Arc<Self>,
        key: CacheKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
        period: Duration,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            queries.stats.record_refresh();
            let result = queries.refetch(&key, fetcher.clone(), &options).await;
            if let Some(error) = result.error {
                debug!(key = %key, error = %error, "Background refresh failed");
            }
        }
    }

    fn detach_refresh(&self, key: &str) {
        if let Entry::Occupied(mut occupied) = self.refreshers.entry(key.to_owned()) {
            occupied.get_mut().subscribers -= 1;
            if occupied.get().subscribers == 0 {
                let refresher = occupied.remove();
                refresher.handle.abort();
                debug!(key, "Background refresh cancelled, last subscriber detached");
            }
        }
    }

    /// Number of keys with an active refresh task.
    pub fn active_refreshers(&self) -> usize {
        self.refreshers.len()
    }

    /// Abort every refresh task. Called by the client on shutdown.
    pub(crate) fn shutdown(&self) {
        for entry in self.refreshers.iter() {
            entry.handle.abort();
        }
        self.refreshers.clear();
    }
}

/// Subscriber handle for a background-refreshed key. Detachment is explicit;
/// dropping the guard without calling [`RefreshGuard::detach`] leaks the
/// subscription, which is the owning consumer's bug.
pub struct RefreshGuard {
    queries: Arc<QueryCoordinator>,
    key: String,
    active: bool,
}

impl RefreshGuard {
    pub fn detach(mut self) {
        if self.active {
            self.active = false;
            self.queries.detach_refresh(&self.key);
        }
    }
}
