use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::{ResolvedConfig, SnapshotStoreKind};
use crate::market_data::{
    AssetPriceSink, JsonFileKeyValueStore, JsonlPriceLog, KeyValueStore, MemoryKeyValueStore,
    NullAssetSink, NullKeyValueStore, PriceCache, PriceResolver, PriceSource,
    PriceSourceRegistry,
};

/// Builds a [`PriceCache`] from resolved config.
///
/// This centralizes registry loading and store selection so the CLI and
/// embedding applications don't duplicate it. Every piece can be swapped
/// out, which is how tests inject mock sources and stores.
pub struct PriceCacheBuilder {
    config: ResolvedConfig,
    snapshot_store: Option<Arc<dyn KeyValueStore>>,
    asset_sink: Option<Arc<dyn AssetPriceSink>>,
    extra_sources: Vec<Arc<dyn PriceSource>>,
    offline_only: bool,
    clock: Arc<dyn Clock>,
}

impl PriceCacheBuilder {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            config: config.clone(),
            snapshot_store: None,
            asset_sink: None,
            extra_sources: Vec::new(),
            offline_only: false,
            clock: Arc::new(SystemClock),
        }
    }

    /// Disable configured network sources and build an offline cache: only
    /// explicitly added sources and pegged symbols resolve, reads never start
    /// a refresh, and nothing is written back to the stores.
    pub fn offline_only(mut self) -> Self {
        self.offline_only = true;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn with_asset_sink(mut self, sink: Arc<dyn AssetPriceSink>) -> Self {
        self.asset_sink = Some(sink);
        self
    }

    /// Add a source on top of the configured ones. A source with the same
    /// name as a configured one replaces it.
    pub fn with_source(mut self, source: Arc<dyn PriceSource>) -> Self {
        self.extra_sources.push(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<PriceCache> {
        let mut resolver = PriceResolver::new(self.config.symbol_table()?);

        if !self.offline_only {
            let registry = PriceSourceRegistry::from_config(&self.config);
            resolver = resolver.with_sources(registry.build_sources());
        }
        resolver = resolver.with_sources(self.extra_sources);
        debug!(sources = ?resolver.source_names(), "price sources ready");

        let snapshot_store: Arc<dyn KeyValueStore> = match self.snapshot_store {
            Some(store) => store,
            None => match self.config.storage.snapshot_store {
                SnapshotStoreKind::File => Arc::new(
                    JsonFileKeyValueStore::new(self.config.cache_dir())
                        .with_clock(self.clock.clone()),
                ),
                SnapshotStoreKind::Memory => {
                    Arc::new(MemoryKeyValueStore::with_clock(self.clock.clone()))
                }
                SnapshotStoreKind::None => Arc::new(NullKeyValueStore),
            },
        };

        let asset_sink: Arc<dyn AssetPriceSink> = match self.asset_sink {
            Some(sink) => sink,
            None if self.config.storage.price_log => Arc::new(
                JsonlPriceLog::new(&self.config.data_dir).with_clock(self.clock.clone()),
            ),
            None => Arc::new(NullAssetSink),
        };

        let cache = PriceCache::new(resolver, self.config.cache.settings())
            .with_snapshot_store(snapshot_store)
            .with_asset_sink(asset_sink)
            .with_clock(self.clock);
        Ok(if self.offline_only { cache.offline() } else { cache })
    }
}
