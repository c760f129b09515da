#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use walletwatch::market_data::{
    AssetPriceSink, KeyValueStore, PriceSource, SourceError, SourceRoute, SymbolEntry,
    SymbolTable,
};

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Symbol table from `(symbol, [(source, id)])` pairs, plus the USDC peg.
pub fn symbol_table(entries: &[(&str, &[(&str, &str)])]) -> SymbolTable {
    let mut table = SymbolTable::default();
    for (symbol, routes) in entries {
        table.insert(SymbolEntry {
            symbol: symbol.to_string(),
            routes: routes
                .iter()
                .map(|(source, id)| SourceRoute::new(*source, *id))
                .collect(),
            peg: None,
        });
    }
    table.insert(SymbolEntry {
        symbol: "USDC".to_string(),
        routes: Vec::new(),
        peg: Some(Decimal::ONE),
    });
    table
}

pub fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Scriptable source: fixed prices, optional delay, optional leading failures,
/// and a call counter.
pub struct ScriptedSource {
    name: String,
    prices: Mutex<HashMap<String, Decimal>>,
    delay: Option<Duration>,
    fail_first: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prices: Mutex::new(HashMap::new()),
            delay: None,
            fail_first: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_price(self, id: &str, price: &str) -> Self {
        self.set_price(id, price);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_price(&self, id: &str, price: &str) {
        self.prices
            .lock()
            .unwrap()
            .insert(id.to_string(), dec(price));
    }

    pub fn remove_price(&self, id: &str) {
        self.prices.lock().unwrap().remove(id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Network("connection reset".to_string()));
        }

        let price = self.prices.lock().unwrap().get(id).copied();
        price.ok_or_else(|| SourceError::Status {
            status: 503,
            body: "unavailable".to_string(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct PanickingSource {
    name: String,
    calls: AtomicUsize,
}

impl PanickingSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for PanickingSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("price parser blew up on {id}");
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A snapshot store that is always down.
pub struct FailingKeyValueStore;

#[async_trait]
impl KeyValueStore for FailingKeyValueStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(anyhow!("connection refused"))
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
}

/// An asset store that rejects every write.
pub struct FailingAssetSink {
    attempts: AtomicUsize,
}

impl FailingAssetSink {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetPriceSink for FailingAssetSink {
    async fn persist_price(&self, _symbol: &str, _price: Decimal) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("disk full"))
    }
}

/// Records writes in order; the first one stalls for `first_delay`.
pub struct SlowFirstAssetSink {
    first_delay: Duration,
    calls: AtomicUsize,
    writes: Mutex<Vec<(String, Decimal)>>,
}

impl SlowFirstAssetSink {
    pub fn new(first_delay: Duration) -> Self {
        Self {
            first_delay,
            calls: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<(String, Decimal)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetPriceSink for SlowFirstAssetSink {
    async fn persist_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.first_delay).await;
        }
        self.writes.lock().unwrap().push((symbol.to_string(), price));
        Ok(())
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
