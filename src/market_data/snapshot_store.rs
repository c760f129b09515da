//! Key-value persistence for the price snapshot.
//!
//! The cache only needs `get` and `set with TTL`; anything offering those two
//! (a JSON file per key here, a shared cache server elsewhere) can back it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::PriceSnapshot;
use crate::clock::{Clock, SystemClock};

/// Key under which the snapshot is stored.
pub const SNAPSHOT_KEY: &str = "crypto_prices";

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).context("TTL out of range")?;
    now.checked_add_signed(ttl).context("TTL out of range")
}

/// Stores nothing. Every read is a miss.
pub struct NullKeyValueStore;

#[async_trait::async_trait]
impl KeyValueStore for NullKeyValueStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryKeyValueStore {
    entries: tokio::sync::Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = expiry(self.clock.now(), ttl)?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    expires_at: DateTime<Utc>,
}

/// One `{key}.json` file per key under `dir`, holding the value and its expiry.
pub struct JsonFileKeyValueStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl JsonFileKeyValueStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for JsonFileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let envelope: Envelope = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if envelope.expires_at <= self.clock.now() {
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let envelope = Envelope {
            value: value.to_string(),
            expires_at: expiry(self.clock.now(), ttl)?,
        };
        let content = serde_json::to_string_pretty(&envelope).context("Failed to serialize entry")?;

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn sanitize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reads and writes the snapshot under [`SNAPSHOT_KEY`].
pub struct SnapshotRepository {
    store: Arc<dyn KeyValueStore>,
}

impl SnapshotRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<Option<PriceSnapshot>> {
        let Some(raw) = self.store.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&raw).context("Failed to decode stored snapshot")?;
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &PriceSnapshot, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(snapshot).context("Failed to encode snapshot")?;
        self.store.set_with_ttl(SNAPSHOT_KEY, &raw, ttl).await
    }
}
