//! Price source registry.
//!
//! Builds the enabled price sources from the resolved config.

use std::sync::Arc;

use tracing::{debug, warn};

use super::http::BackoffPolicy;
use super::providers::{
    BinancePriceSource, CoinCapPriceSource, CoinGeckoPriceSource, CryptoComparePriceSource,
    MempoolPriceSource,
};
use super::source_config::{SourceConfig, SourceKind};
use super::PriceSource;
use crate::config::ResolvedConfig;

/// A configured source, before it is built.
#[derive(Debug, Clone)]
pub struct LoadedPriceSource {
    pub kind: SourceKind,
    pub config: SourceConfig,
    pub policy: BackoffPolicy,
}

/// Registry of configured price sources, in [`SourceKind::ALL`] order.
pub struct PriceSourceRegistry {
    loaded: Vec<LoadedPriceSource>,
}

impl PriceSourceRegistry {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let mut loaded = Vec::new();

        for kind in SourceKind::ALL {
            let source = config.source(kind);
            if !source.enabled {
                debug!(source = %kind, "price source disabled");
                continue;
            }
            let policy = config.http.policy_for(&source);
            loaded.push(LoadedPriceSource {
                kind,
                config: source,
                policy,
            });
        }

        Self { loaded }
    }

    /// Get all enabled source configurations.
    pub fn sources(&self) -> &[LoadedPriceSource] {
        &self.loaded
    }

    pub fn build_sources(&self) -> Vec<Arc<dyn PriceSource>> {
        self.loaded.iter().map(build_source).collect()
    }
}

fn build_source(loaded: &LoadedPriceSource) -> Arc<dyn PriceSource> {
    let base_url = loaded
        .config
        .base_url
        .clone()
        .unwrap_or_else(|| loaded.kind.default_base_url().to_string());
    let policy = loaded.policy.clone();
    let api_key = loaded.config.resolve_api_key();

    if api_key.is_some() && !loaded.kind.accepts_api_key() {
        warn!(source = %loaded.kind, "api key configured but not used by this source");
    }

    match loaded.kind {
        SourceKind::Mempool => Arc::new(
            MempoolPriceSource::new()
                .with_base_url(base_url)
                .with_policy(policy),
        ),
        SourceKind::Coingecko => {
            let mut source = CoinGeckoPriceSource::new()
                .with_base_url(base_url)
                .with_policy(policy);
            if let Some(key) = api_key {
                source = source.with_api_key(key);
            }
            Arc::new(source)
        }
        SourceKind::Coincap => {
            let mut source = CoinCapPriceSource::new()
                .with_base_url(base_url)
                .with_policy(policy);
            if let Some(key) = api_key {
                source = source.with_api_key(key);
            }
            Arc::new(source)
        }
        SourceKind::Cryptocompare => {
            let mut source = CryptoComparePriceSource::new()
                .with_base_url(base_url)
                .with_policy(policy);
            if let Some(key) = api_key {
                source = source.with_api_key(key);
            }
            Arc::new(source)
        }
        SourceKind::Binance => Arc::new(
            BinancePriceSource::new()
                .with_base_url(base_url)
                .with_policy(policy),
        ),
    }
}
