//! Snapshot store and asset sink behaviour around the price cache.

mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use support::{
    dec, eventually, symbol_table, symbols, t0, FailingAssetSink, FailingKeyValueStore,
    ScriptedSource, SlowFirstAssetSink,
};
use tempfile::TempDir;
use walletwatch::clock::{Clock, FixedClock, ManualClock};
use walletwatch::market_data::{
    CacheError, CacheSettings, JsonFileKeyValueStore, JsonlPriceLog, KeyValueStore,
    MemoryAssetSink, MemoryKeyValueStore, Price, PriceCache, PriceResolver, PriceSnapshot,
    SnapshotRepository, SNAPSHOT_KEY,
};
use walletwatch::staleness::Freshness;

fn settings(list: &[&str], require_persistence: bool) -> CacheSettings {
    CacheSettings {
        stale_threshold: Duration::from_secs(5 * 60),
        snapshot_ttl: Duration::from_secs(10 * 60),
        require_persistence,
        symbols: symbols(list),
    }
}

fn btc_resolver(price: &str) -> PriceResolver {
    let source = Arc::new(ScriptedSource::new("primary").with_price("bitcoin", price));
    PriceResolver::new(symbol_table(&[("BTC", &[("primary", "bitcoin")])])).with_source(source)
}

#[tokio::test]
async fn store_outage_degrades_to_memory() -> Result<()> {
    let cache = PriceCache::new(btc_resolver("51000"), settings(&["BTC"], false))
        .with_snapshot_store(Arc::new(FailingKeyValueStore))
        .with_clock(Arc::new(FixedClock::new(t0())));

    assert!(cache.get_prices().await.is_none());
    cache.wait_for_refresh().await;

    let snapshot = cache.get_prices().await.expect("served from memory");
    assert_eq!(snapshot.price("BTC"), Price::Known(dec("51000")));

    let forced = cache.get_fresh_prices().await?;
    assert_eq!(forced.price("BTC"), Price::Known(dec("51000")));
    Ok(())
}

#[tokio::test]
async fn required_persistence_fails_forced_refresh() -> Result<()> {
    let cache = PriceCache::new(btc_resolver("51000"), settings(&["BTC"], true))
        .with_snapshot_store(Arc::new(FailingKeyValueStore))
        .with_clock(Arc::new(FixedClock::new(t0())));

    let err = cache.get_fresh_prices().await.unwrap_err();
    assert!(matches!(err, CacheError::PersistenceRequired(_)));

    // The refreshed prices are still served from memory.
    let snapshot = cache.snapshot().expect("in-memory snapshot");
    assert_eq!(snapshot.price("BTC"), Price::Known(dec("51000")));
    assert!(!cache.state().refreshing);
    Ok(())
}

#[tokio::test]
async fn snapshot_survives_restart_through_file_store() -> Result<()> {
    let dir = TempDir::new()?;
    let clock = Arc::new(ManualClock::new(t0()));

    let first = PriceCache::new(btc_resolver("51000"), settings(&["BTC", "USDC"], false))
        .with_snapshot_store(Arc::new(
            JsonFileKeyValueStore::new(dir.path()).with_clock(clock.clone()),
        ))
        .with_clock(clock.clone());
    first.get_fresh_prices().await?;

    clock.advance(chrono::Duration::minutes(2));

    // No sources at all: anything it serves came from the file.
    let second = PriceCache::new(
        PriceResolver::new(symbol_table(&[])),
        settings(&["BTC", "USDC"], false),
    )
    .with_snapshot_store(Arc::new(
        JsonFileKeyValueStore::new(dir.path()).with_clock(clock.clone()),
    ))
    .with_clock(clock.clone());

    let snapshot = second.get_prices().await.expect("hydrated from file");
    assert_eq!(snapshot.price("BTC"), Price::Known(dec("51000")));
    assert_eq!(snapshot.price("USDC"), Price::Known(dec("1")));
    assert_eq!(snapshot.last_updated(), Some(t0()));
    assert_eq!(second.state().freshness, Freshness::Fresh);
    assert!(!second.state().refreshing);
    Ok(())
}

#[tokio::test]
async fn expired_snapshot_is_not_hydrated() -> Result<()> {
    let dir = TempDir::new()?;
    let clock = Arc::new(ManualClock::new(t0()));
    let store: Arc<dyn KeyValueStore> =
        Arc::new(JsonFileKeyValueStore::new(dir.path()).with_clock(clock.clone()));

    let cache = PriceCache::new(btc_resolver("51000"), settings(&["BTC"], false))
        .with_snapshot_store(store.clone())
        .with_clock(clock.clone());
    cache.get_fresh_prices().await?;
    assert!(SnapshotRepository::new(store.clone()).load().await?.is_some());

    clock.advance(chrono::Duration::minutes(11));
    assert!(SnapshotRepository::new(store.clone()).load().await?.is_none());

    let restarted = PriceCache::new(
        PriceResolver::new(symbol_table(&[])),
        settings(&["BTC"], false),
    )
    .with_snapshot_store(store)
    .with_clock(clock.clone());
    assert!(restarted.get_prices().await.is_none());
    Ok(())
}

#[tokio::test]
async fn stored_snapshot_uses_wire_format() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(JsonFileKeyValueStore::new(dir.path()));
    let source = Arc::new(ScriptedSource::new("primary").with_price("bitcoin", "51000.25"));
    let resolver = PriceResolver::new(symbol_table(&[
        ("BTC", &[("primary", "bitcoin")]),
        ("ETH", &[("primary", "ethereum")]),
    ]))
    .with_source(source);
    let cache = PriceCache::new(resolver, settings(&["BTC", "ETH"], false))
        .with_snapshot_store(store.clone())
        .with_clock(Arc::new(FixedClock::new(t0())));

    cache.get_fresh_prices().await?;

    let raw = store.get(SNAPSHOT_KEY).await?.expect("stored value");
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(value["BTC"], serde_json::json!(51000.25));
    assert!(value["ETH"].is_null());
    assert_eq!(value["lastUpdated"], serde_json::json!(t0().timestamp_millis()));
    Ok(())
}

#[tokio::test]
async fn refreshed_prices_reach_the_asset_sink() -> Result<()> {
    let sink = Arc::new(MemoryAssetSink::new());
    let cache = PriceCache::new(btc_resolver("51000"), settings(&["BTC", "ETH", "USDC"], false))
        .with_asset_sink(sink.clone())
        .with_clock(Arc::new(FixedClock::new(t0())));

    cache.get_fresh_prices().await?;

    let sink_ref = sink.as_ref();
    let delivered = eventually(Duration::from_secs(2), || async move {
        sink_ref.writes().await.len() == 2
    })
    .await;
    assert!(delivered);
    assert_eq!(sink.latest("BTC").await, Some(dec("51000")));
    assert_eq!(sink.latest("USDC").await, Some(dec("1")));
    // ETH never resolved, so nothing was written for it.
    assert_eq!(sink.latest("ETH").await, None);
    Ok(())
}

#[tokio::test]
async fn failing_asset_sink_does_not_affect_the_snapshot() -> Result<()> {
    let sink = Arc::new(FailingAssetSink::new());
    let cache = PriceCache::new(btc_resolver("51000"), settings(&["BTC"], true))
        .with_asset_sink(sink.clone())
        .with_clock(Arc::new(FixedClock::new(t0())));

    let snapshot = cache.get_fresh_prices().await?;
    assert_eq!(snapshot.price("BTC"), Price::Known(dec("51000")));

    let sink_ref = sink.as_ref();
    assert!(eventually(Duration::from_secs(2), || async move { sink_ref.attempts() == 1 }).await);
    Ok(())
}

#[tokio::test]
async fn price_log_skips_unchanged_prices() -> Result<()> {
    let dir = TempDir::new()?;
    let clock = Arc::new(ManualClock::new(t0()));
    let log = Arc::new(JsonlPriceLog::new(dir.path()).with_clock(clock.clone()));
    let source = Arc::new(ScriptedSource::new("primary").with_price("bitcoin", "51000"));
    let resolver = PriceResolver::new(symbol_table(&[("BTC", &[("primary", "bitcoin")])]))
        .with_source(source.clone());
    let cache = PriceCache::new(resolver, settings(&["BTC"], false))
        .with_asset_sink(log.clone())
        .with_clock(clock.clone());

    cache.get_fresh_prices().await?;
    cache.flush_asset_writes().await;
    assert_eq!(log.history("BTC").await?.len(), 1);

    clock.advance(chrono::Duration::minutes(10));
    cache.get_fresh_prices().await?;
    cache.flush_asset_writes().await;
    assert_eq!(log.history("BTC").await?.len(), 1);

    clock.advance(chrono::Duration::minutes(10));
    source.set_price("bitcoin", "51500");
    cache.get_fresh_prices().await?;
    cache.flush_asset_writes().await;
    assert_eq!(log.history("BTC").await?.len(), 2);

    let history = log.history("BTC").await?;
    assert_eq!(history[0].price, "51000");
    assert_eq!(history[1].price, "51500");
    assert_eq!(history[1].timestamp, t0() + chrono::Duration::minutes(20));
    Ok(())
}

#[tokio::test]
async fn asset_writes_land_in_refresh_order() -> Result<()> {
    let clock = Arc::new(ManualClock::new(t0()));
    let sink = Arc::new(SlowFirstAssetSink::new(Duration::from_millis(200)));
    let source = Arc::new(ScriptedSource::new("primary").with_price("bitcoin", "51000"));
    let resolver = PriceResolver::new(symbol_table(&[("BTC", &[("primary", "bitcoin")])]))
        .with_source(source.clone());
    let cache = PriceCache::new(resolver, settings(&["BTC"], false))
        .with_asset_sink(sink.clone())
        .with_clock(clock.clone());

    cache.get_fresh_prices().await?;
    clock.advance(chrono::Duration::minutes(10));
    source.set_price("bitcoin", "52000");
    cache.get_fresh_prices().await?;

    // The first write is still stalled; the refresh did not wait on it.
    assert!(sink.writes().is_empty());

    cache.flush_asset_writes().await;
    assert_eq!(
        sink.writes(),
        vec![
            ("BTC".to_string(), dec("51000")),
            ("BTC".to_string(), dec("52000")),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn offline_stale_read_leaves_the_store_alone() -> Result<()> {
    let clock = Arc::new(ManualClock::new(t0()));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::with_clock(clock.clone()));
    let repo = SnapshotRepository::new(store.clone());
    repo.save(
        &PriceSnapshot::default()
            .with_price("BTC", Price::Known(dec("50000")))
            .with_last_updated(t0()),
        Duration::from_secs(2 * 3600),
    )
    .await?;
    clock.advance(chrono::Duration::minutes(10));

    let sink = Arc::new(MemoryAssetSink::new());
    let offline = PriceCache::new(
        PriceResolver::new(symbol_table(&[])),
        settings(&["BTC", "USDC"], false),
    )
    .with_snapshot_store(store.clone())
    .with_asset_sink(sink.clone())
    .with_clock(clock.clone())
    .offline();

    let served = offline.get_prices().await.expect("stored snapshot");
    assert_eq!(served.last_updated(), Some(t0()));
    assert_eq!(offline.state().freshness, Freshness::Stale);
    assert!(!offline.state().refreshing);
    offline.wait_for_refresh().await;
    assert_eq!(repo.load().await?.and_then(|s| s.last_updated()), Some(t0()));

    // A forced offline refresh resolves pegs in memory and writes nothing.
    let forced = offline.get_fresh_prices().await?;
    assert_eq!(forced.price("USDC"), Price::Known(dec("1")));
    offline.flush_asset_writes().await;
    assert!(sink.writes().await.is_empty());
    let stored = repo.load().await?.expect("still stored");
    assert_eq!(stored.last_updated(), Some(t0()));
    assert_eq!(stored.price("USDC"), Price::Unknown);

    // An online cache sharing the store still sees it as stale and refetches.
    let source = Arc::new(ScriptedSource::new("primary").with_price("bitcoin", "51000"));
    let online = PriceCache::new(
        PriceResolver::new(symbol_table(&[("BTC", &[("primary", "bitcoin")])]))
            .with_source(source.clone()),
        settings(&["BTC"], false),
    )
    .with_snapshot_store(store.clone())
    .with_clock(clock.clone());

    online.get_prices().await.expect("stored snapshot");
    online.wait_for_refresh().await;
    assert_eq!(source.calls(), 1);
    assert_eq!(
        repo.load().await?.and_then(|s| s.last_updated()),
        Some(clock.now())
    );
    Ok(())
}
