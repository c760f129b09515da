use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};
use crate::market_data::{
    normalize_symbol, BackoffPolicy, CacheSettings, SourceConfig, SourceKind, SymbolSpec,
    SymbolTable, DEFAULT_SYMBOLS,
};

/// Default stale threshold (5 minutes).
fn default_stale_threshold() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Default snapshot TTL (10 minutes).
fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_symbols() -> Vec<String> {
    DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
}

/// Price cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How old the snapshot can be before reads trigger a background refresh.
    #[serde(
        default = "default_stale_threshold",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub stale_threshold: Duration,

    /// How long the persisted snapshot lives in the store. Raised to
    /// `stale_threshold` if configured lower.
    #[serde(
        default = "default_snapshot_ttl",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub snapshot_ttl: Duration,

    /// Make forced refreshes fail when the snapshot cannot be persisted.
    pub require_persistence: bool,

    /// Symbols refreshed on every cycle.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_threshold: default_stale_threshold(),
            snapshot_ttl: default_snapshot_ttl(),
            require_persistence: false,
            symbols: default_symbols(),
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        let mut symbols: Vec<String> = Vec::new();
        for symbol in &self.symbols {
            let symbol = normalize_symbol(symbol);
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }

        CacheSettings {
            stale_threshold: self.stale_threshold,
            snapshot_ttl: self.snapshot_ttl.max(self.stale_threshold),
            require_persistence: self.require_persistence,
            symbols,
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_min_interval() -> Duration {
    Duration::from_millis(250)
}

/// HTTP behaviour shared by every price source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,

    /// Total attempts for a rate-limited request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(
        default = "default_backoff_base",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub backoff_base: Duration,

    /// Minimum gap between two requests to the same source.
    #[serde(
        default = "default_min_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub min_interval: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            min_interval: default_min_interval(),
        }
    }
}

impl HttpConfig {
    /// Backoff policy for one source; per-source overrides win.
    pub fn policy_for(&self, source: &SourceConfig) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: self.backoff_base,
            min_interval: source.min_interval.unwrap_or(self.min_interval),
            timeout: source.timeout.unwrap_or(self.timeout),
        }
    }
}

/// Where the price snapshot is persisted between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStoreKind {
    /// JSON file under `{data_dir}/cache/`.
    #[default]
    File,
    /// Process memory only.
    Memory,
    /// Nothing is persisted.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_store: SnapshotStoreKind,

    /// Append refreshed prices to `{data_dir}/prices/<SYMBOL>.jsonl`.
    pub price_log: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_store: SnapshotStoreKind::File,
            price_log: true,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    pub cache: CacheConfig,

    pub http: HttpConfig,

    pub storage: StorageConfig,

    /// Per-source settings keyed by source name (`[sources.coingecko]`).
    pub sources: BTreeMap<String, SourceConfig>,

    /// Symbol route overrides (`[symbols.BTC]`).
    pub symbols: BTreeMap<String, SymbolSpec>,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory path.
    ///
    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Loaded configuration with resolved paths and validated source names.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The resolved data directory path.
    pub data_dir: PathBuf,

    pub cache: CacheConfig,

    pub http: HttpConfig,

    pub storage: StorageConfig,

    pub sources: BTreeMap<SourceKind, SourceConfig>,

    pub symbols: BTreeMap<String, SymbolSpec>,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./walletwatch.toml` if it exists in current directory
/// 2. `~/.local/share/walletwatch/walletwatch.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("walletwatch.toml");
    if local_config.exists() {
        return local_config;
    }

    // XDG data directory fallback
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("walletwatch").join("walletwatch.toml");
    }

    // Final fallback to local
    local_config
}

impl ResolvedConfig {
    /// Load and resolve config from a file path.
    ///
    /// The data directory is resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        let data_dir = config.resolve_data_dir(config_dir);
        Self::from_config(config, data_dir)
    }

    /// Load config, falling back to defaults if the file doesn't exist.
    ///
    /// If the config file doesn't exist, uses the config file's intended
    /// parent directory as the data directory.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        // Resolve the config path relative to current directory
        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        // Use the intended config directory as data dir
        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;

        Self::from_config(Config::default(), config_dir.to_path_buf())
    }

    pub fn from_config(config: Config, data_dir: PathBuf) -> Result<Self> {
        let mut sources = BTreeMap::new();
        for (name, source) in config.sources {
            let kind = SourceKind::from_str(&name)
                .with_context(|| format!("Invalid [sources.{name}] table"))?;
            sources.insert(kind, source);
        }

        let resolved = Self {
            data_dir,
            cache: config.cache,
            http: config.http,
            storage: config.storage,
            sources,
            symbols: config.symbols,
        };

        // Surface bad symbol overrides at load time rather than on first refresh.
        resolved.symbol_table()?;
        Ok(resolved)
    }

    /// Settings for `kind`, or defaults when the config has no table for it.
    pub fn source(&self, kind: SourceKind) -> SourceConfig {
        self.sources.get(&kind).cloned().unwrap_or_default()
    }

    pub fn symbol_table(&self) -> Result<SymbolTable> {
        SymbolTable::builtin().with_overrides(&self.symbols)
    }

    /// Directory holding the persisted snapshot.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}
