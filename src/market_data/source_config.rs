//! Price source configuration.
//!
//! Defines the `[sources.<name>]` tables of the config file.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration_opt, serialize_duration_opt};

use super::providers::{binance, coincap, coingecko, cryptocompare, mempool};

/// Known price source types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// mempool.space bitcoin ticker
    Mempool,
    /// CoinGecko aggregator
    Coingecko,
    /// CoinCap aggregator
    Coincap,
    /// CryptoCompare aggregator
    Cryptocompare,
    /// Binance spot ticker
    Binance,
}

impl SourceKind {
    /// Registration order for the built-in sources.
    pub const ALL: [SourceKind; 5] = [
        Self::Mempool,
        Self::Coingecko,
        Self::Coincap,
        Self::Cryptocompare,
        Self::Binance,
    ];

    /// Name used in symbol routes and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mempool => "mempool",
            Self::Coingecko => "coingecko",
            Self::Coincap => "coincap",
            Self::Cryptocompare => "cryptocompare",
            Self::Binance => "binance",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Mempool => mempool::MEMPOOL_API_BASE,
            Self::Coingecko => coingecko::COINGECKO_API_BASE,
            Self::Coincap => coincap::COINCAP_API_BASE,
            Self::Cryptocompare => cryptocompare::CRYPTOCOMPARE_API_BASE,
            Self::Binance => binance::BINANCE_API_BASE,
        }
    }

    /// Whether this source sends an API key when one is configured.
    pub fn accepts_api_key(&self) -> bool {
        matches!(self, Self::Coingecko | Self::Coincap | Self::Cryptocompare)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("Unknown price source: {s}"))
    }
}

/// Per-source settings. Every field is optional; unset fields fall back to
/// the source's defaults and the global `[http]` settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// API key, inline. Prefer `api_key_env` for anything checked in.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Name of an environment variable holding the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_interval: Option<Duration>,

    #[serde(
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            api_key_env: None,
            min_interval: None,
            timeout: None,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("min_interval", &self.min_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SourceConfig {
    /// The configured API key: the inline value wins over the environment.
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Some(SecretString::from(key.trim().to_string()));
        }
        let var = self.api_key_env.as_deref()?;
        std::env::var(var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|k| SecretString::from(k.trim().to_string()))
    }
}
