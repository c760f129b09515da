//! Stale-while-refresh price cache.
//!
//! Readers always get the last good snapshot immediately. When that snapshot
//! is missing or older than the stale threshold, a refresh runs in a detached
//! task; at most one refresh is in flight per cache, guarded by an async mutex
//! whose owned guard moves into the task and drops on every exit path.
//!
//! Fetched prices go to the asset sink through one queue, in refresh order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::sink::SinkQueue;
use super::{
    AssetPriceSink, CacheError, KeyValueStore, NullAssetSink, NullKeyValueStore, Price,
    PriceResolver, PriceSnapshot, SnapshotRepository, SymbolResolution,
};
use crate::clock::{Clock, SystemClock};
use crate::staleness::{check_snapshot_staleness, log_snapshot_staleness, CacheState};

pub const DEFAULT_SYMBOLS: [&str; 5] = ["BTC", "ETH", "SOL", "USDC", "XMR"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub stale_threshold: Duration,
    pub snapshot_ttl: Duration,
    /// Fail forced refreshes when the snapshot cannot be persisted.
    pub require_persistence: bool,
    pub symbols: Vec<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(5 * 60),
            snapshot_ttl: Duration::from_secs(10 * 60),
            require_persistence: false,
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CacheSettings {
    /// The stored snapshot must outlive the stale threshold.
    pub fn effective_ttl(&self) -> Duration {
        self.snapshot_ttl.max(self.stale_threshold)
    }
}

struct RefreshState {
    current: RwLock<Option<Arc<PriceSnapshot>>>,
    lock: Arc<Mutex<()>>,
    /// Number of completed refreshes; lets a forced refresh notice that the
    /// one it waited on already produced a new snapshot.
    completed: AtomicU64,
}

#[derive(Clone)]
pub struct PriceCache {
    resolver: Arc<PriceResolver>,
    snapshots: Arc<SnapshotRepository>,
    sink: Arc<SinkQueue>,
    clock: Arc<dyn Clock>,
    settings: Arc<CacheSettings>,
    state: Arc<RefreshState>,
    offline: bool,
}

impl PriceCache {
    pub fn new(resolver: PriceResolver, settings: CacheSettings) -> Self {
        Self {
            resolver: Arc::new(resolver),
            snapshots: Arc::new(SnapshotRepository::new(Arc::new(NullKeyValueStore))),
            sink: Arc::new(SinkQueue::new(Arc::new(NullAssetSink))),
            clock: Arc::new(SystemClock),
            settings: Arc::new(settings),
            state: Arc::new(RefreshState {
                current: RwLock::new(None),
                lock: Arc::new(Mutex::new(())),
                completed: AtomicU64::new(0),
            }),
            offline: false,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.snapshots = Arc::new(SnapshotRepository::new(store));
        self
    }

    pub fn with_asset_sink(mut self, sink: Arc<dyn AssetPriceSink>) -> Self {
        self.sink = Arc::new(SinkQueue::new(sink));
        self
    }

    /// Serve the stored snapshot read-only. Stale reads no longer start a
    /// refresh, and forced refreshes stay in memory: nothing is written to
    /// the snapshot store or the asset sink.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &PriceResolver {
        &self.resolver
    }

    /// The in-memory snapshot, without touching the store or triggering anything.
    pub fn snapshot(&self) -> Option<Arc<PriceSnapshot>> {
        self.state
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> CacheState {
        let snapshot = self.snapshot();
        let check = check_snapshot_staleness(
            snapshot.as_deref(),
            self.settings.stale_threshold,
            self.clock.now(),
        );
        CacheState {
            freshness: check.freshness(),
            refreshing: self.state.lock.try_lock().is_err(),
        }
    }

    /// Last good snapshot, returned without waiting on any price source.
    ///
    /// Returns `None` only when nothing is cached in memory or in the store.
    /// Starts a background refresh when the snapshot is missing or stale,
    /// unless the cache is offline.
    pub async fn get_prices(&self) -> Option<Arc<PriceSnapshot>> {
        let snapshot = match self.snapshot() {
            Some(snapshot) => Some(snapshot),
            None => self.hydrate().await,
        };

        let check = check_snapshot_staleness(
            snapshot.as_deref(),
            self.settings.stale_threshold,
            self.clock.now(),
        );
        log_snapshot_staleness(&check);
        if check.is_stale {
            if self.offline {
                debug!("offline; serving stored snapshot without refreshing");
            } else {
                self.trigger_refresh();
            }
        }

        snapshot
    }

    /// Waits for a refresh that completes after this call and returns its
    /// snapshot. Joins the in-flight refresh if there is one.
    pub async fn get_fresh_prices(&self) -> Result<Arc<PriceSnapshot>, CacheError> {
        let seen = self.state.completed.load(Ordering::SeqCst);
        self.refresh_after(seen).await
    }

    /// Like [`PriceCache::get_prices`], but awaits the first refresh instead
    /// of returning `None` on a cold cache.
    pub async fn get_prices_or_refresh(&self) -> Result<Arc<PriceSnapshot>, CacheError> {
        let seen = self.state.completed.load(Ordering::SeqCst);
        if let Some(snapshot) = self.get_prices().await {
            return Ok(snapshot);
        }
        self.refresh_after(seen).await
    }

    /// Start a background refresh unless one is already running. Returns
    /// whether a new refresh was started.
    pub fn trigger_refresh(&self) -> bool {
        let guard = match self.state.lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("price refresh already in flight");
                return false;
            }
        };

        let cache = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = cache.refresh_locked().await {
                warn!(error = %e, "background price refresh failed");
            }
        });
        true
    }

    /// Resolves once no refresh is in flight.
    pub async fn wait_for_refresh(&self) {
        let _guard = self.state.lock.lock().await;
    }

    /// Resolves once every asset price write queued so far has been attempted.
    pub async fn flush_asset_writes(&self) {
        self.sink.flush().await;
    }

    async fn refresh_after(&self, seen: u64) -> Result<Arc<PriceSnapshot>, CacheError> {
        let guard = self.state.lock.clone().lock_owned().await;

        if self.state.completed.load(Ordering::SeqCst) != seen {
            if let Some(snapshot) = self.snapshot() {
                debug!("joined in-flight price refresh");
                return Ok(snapshot);
            }
        }

        let cache = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            cache.refresh_locked().await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::RefreshAborted(e.to_string())),
        }
    }

    /// Caller must hold the refresh lock.
    async fn refresh_locked(&self) -> Result<Arc<PriceSnapshot>, CacheError> {
        let started = Instant::now();
        let base = match self.snapshot() {
            Some(snapshot) => snapshot,
            None => self.hydrate().await.unwrap_or_default(),
        };

        let resolutions = self.resolver.resolve_all(&self.settings.symbols).await;
        let merged = Arc::new(merge_snapshot(&base, &resolutions, self.clock.now()));

        *self
            .state
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(merged.clone());
        self.state.completed.fetch_add(1, Ordering::SeqCst);

        let updated: Vec<(String, Decimal)> = resolutions
            .values()
            .filter_map(|r| r.resolution.price().map(|price| (r.symbol.clone(), price)))
            .collect();
        info!(
            symbols = resolutions.len(),
            updated = updated.len(),
            unresolved = resolutions.len() - updated.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "price refresh complete"
        );

        if self.offline {
            debug!("offline; refreshed snapshot kept in memory only");
            return Ok(merged);
        }

        self.sink.enqueue(updated);

        if let Err(e) = self
            .snapshots
            .save(&merged, self.settings.effective_ttl())
            .await
        {
            if self.settings.require_persistence {
                return Err(CacheError::PersistenceRequired(e));
            }
            warn!(error = %format!("{e:#}"), "failed to persist price snapshot; continuing in memory");
        }

        Ok(merged)
    }

    /// Load the stored snapshot into memory if memory is still empty.
    async fn hydrate(&self) -> Option<Arc<PriceSnapshot>> {
        let loaded = match self.snapshots.load().await {
            Ok(Some(snapshot)) => Arc::new(snapshot),
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "price snapshot store unavailable");
                return None;
            }
        };

        let mut current = self
            .state
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(existing) => Some(existing.clone()),
            None => {
                debug!(symbols = loaded.prices().len(), "hydrated price snapshot from store");
                *current = Some(loaded.clone());
                Some(loaded)
            }
        }
    }
}

/// Merge one refresh into the previous snapshot.
///
/// Successful resolutions replace the previous price. Failed ones keep it, or
/// record `Unknown` for a symbol never seen before. Symbols outside this
/// refresh are carried over untouched.
pub fn merge_snapshot(
    previous: &PriceSnapshot,
    resolutions: &BTreeMap<String, SymbolResolution>,
    completed_at: chrono::DateTime<chrono::Utc>,
) -> PriceSnapshot {
    let mut prices = previous.prices().clone();

    for (symbol, resolution) in resolutions {
        match resolution.resolution.price().map(Price::from_decimal) {
            Some(Price::Known(value)) => {
                prices.insert(symbol.clone(), Price::Known(value));
            }
            _ => {
                prices.entry(symbol.clone()).or_insert(Price::Unknown);
            }
        }
    }

    PriceSnapshot::new(prices, Some(completed_at))
}
