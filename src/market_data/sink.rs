//! Downstream asset store that receives every freshly fetched price.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{normalize_symbol, PricePoint};
use crate::clock::{Clock, SystemClock};

#[async_trait::async_trait]
pub trait AssetPriceSink: Send + Sync {
    /// Persist the latest USD price for `symbol`.
    async fn persist_price(&self, symbol: &str, price: Decimal) -> Result<()>;
}

pub struct NullAssetSink;

#[async_trait::async_trait]
impl AssetPriceSink for NullAssetSink {
    async fn persist_price(&self, _symbol: &str, _price: Decimal) -> Result<()> {
        Ok(())
    }
}

/// Records every write, in order.
#[derive(Default)]
pub struct MemoryAssetSink {
    writes: tokio::sync::Mutex<Vec<(String, Decimal)>>,
}

impl MemoryAssetSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn writes(&self) -> Vec<(String, Decimal)> {
        self.writes.lock().await.clone()
    }

    pub async fn latest(&self, symbol: &str) -> Option<Decimal> {
        let symbol = normalize_symbol(symbol);
        self.writes
            .lock()
            .await
            .iter()
            .rev()
            .find(|(s, _)| *s == symbol)
            .map(|(_, price)| *price)
    }
}

#[async_trait::async_trait]
impl AssetPriceSink for MemoryAssetSink {
    async fn persist_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        self.writes
            .lock()
            .await
            .push((normalize_symbol(symbol), price));
        Ok(())
    }
}

enum SinkMessage {
    Write(Vec<(String, Decimal)>),
    Flush(oneshot::Sender<()>),
}

/// Feeds an [`AssetPriceSink`] from one long-lived task, so writes land in
/// the order they were queued and callers never wait on them.
///
/// The worker starts on the first write and exits once the queue is dropped.
pub(crate) struct SinkQueue {
    sink: Arc<dyn AssetPriceSink>,
    tx: Mutex<Option<mpsc::UnboundedSender<SinkMessage>>>,
}

impl SinkQueue {
    pub(crate) fn new(sink: Arc<dyn AssetPriceSink>) -> Self {
        Self {
            sink,
            tx: Mutex::new(None),
        }
    }

    pub(crate) fn enqueue(&self, updated: Vec<(String, Decimal)>) {
        if updated.is_empty() {
            return;
        }
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let sender = match tx.as_ref() {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let sender = spawn_worker(self.sink.clone());
                *tx = Some(sender.clone());
                sender
            }
        };
        if sender.send(SinkMessage::Write(updated)).is_err() {
            warn!("asset price writer stopped; dropping price updates");
        }
    }

    /// Resolves once every write queued before this call has been attempted.
    pub(crate) async fn flush(&self) {
        let sender = match self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(sender) => sender.clone(),
            None => return,
        };
        let (ack, done) = oneshot::channel();
        if sender.send(SinkMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

fn spawn_worker(sink: Arc<dyn AssetPriceSink>) -> mpsc::UnboundedSender<SinkMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SinkMessage::Write(updated) => {
                    for (symbol, price) in updated {
                        if let Err(e) = sink.persist_price(&symbol, price).await {
                            warn!(symbol = %symbol, error = %e, "failed to persist asset price");
                        }
                    }
                }
                SinkMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("asset price writer stopped");
    });
    tx
}

/// Append-only price log: one JSONL file per symbol under `{base}/prices/`.
///
/// A write whose price equals the latest logged price is skipped, so
/// repeated refreshes of an unchanged market do not grow the file.
pub struct JsonlPriceLog {
    base_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl JsonlPriceLog {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn price_file(&self, symbol: &str) -> PathBuf {
        self.base_path
            .join("prices")
            .join(format!("{}.jsonl", sanitize_symbol(symbol)))
    }

    pub async fn history(&self, symbol: &str) -> Result<Vec<PricePoint>> {
        read_jsonl(&self.price_file(symbol)).await
    }

    pub async fn latest(&self, symbol: &str) -> Result<Option<PricePoint>> {
        Ok(self.history(symbol).await?.pop())
    }
}

#[async_trait::async_trait]
impl AssetPriceSink for JsonlPriceLog {
    async fn persist_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        let symbol = normalize_symbol(symbol);
        let price = price.normalize();

        if let Some(latest) = self.latest(&symbol).await? {
            if latest.price == price.to_string() {
                return Ok(());
            }
        }

        let point = PricePoint {
            symbol: symbol.clone(),
            price: price.to_string(),
            quote_currency: "USD".to_string(),
            timestamp: self.clock.now(),
        };
        append_jsonl(&self.price_file(&symbol), &[point]).await
    }
}

async fn read_jsonl<T: for<'de> serde::Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("Failed to open file"),
    };

    let mut lines = BufReader::new(file).lines();
    let mut items = Vec::new();

    while let Some(line) = lines.next_line().await.context("Failed to read line")? {
        if line.trim().is_empty() {
            continue;
        }
        let item: T = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse JSONL line: {line}"))?;
        items.push(item);
    }

    Ok(items)
}

async fn append_jsonl<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create directory")?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context("Failed to open file for append")?;

    for item in items {
        let line = serde_json::to_string(item).context("Failed to serialize item")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;

    Ok(())
}

fn sanitize_symbol(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_uppercase()
}
