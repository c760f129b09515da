mod builder;
mod cache;
mod error;
pub mod http;
mod models;
mod provider;
pub mod providers;
mod registry;
mod resolver;
mod sink;
mod snapshot_store;
mod source_config;
mod symbols;
mod valuation;

pub use builder::PriceCacheBuilder;
pub use cache::{merge_snapshot, CacheSettings, PriceCache, DEFAULT_SYMBOLS};
pub use error::{CacheError, SourceError};
pub use http::{BackoffPolicy, RetryingClient};
pub use models::{
    decimal_from_f64, normalize_symbol, Price, PricePoint, PriceSnapshot, Resolution,
    SourceResult, SymbolResolution,
};
pub use provider::{parse_price_value, validate_price, PriceSource};
pub use registry::{LoadedPriceSource, PriceSourceRegistry};
pub use resolver::PriceResolver;
pub use sink::{AssetPriceSink, JsonlPriceLog, MemoryAssetSink, NullAssetSink};
pub use snapshot_store::{
    JsonFileKeyValueStore, KeyValueStore, MemoryKeyValueStore, NullKeyValueStore,
    SnapshotRepository, SNAPSHOT_KEY,
};
pub use source_config::{SourceConfig, SourceKind};
pub use symbols::{SourceRoute, SymbolEntry, SymbolSpec, SymbolTable};
pub use valuation::{parse_holding, value_holdings, Holding, PortfolioValuation, ValuationLineItem};
