//! Symbol routing: which sources serve a symbol, in which order, and under
//! which provider-specific identifier.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::normalize_symbol;

/// One step in a symbol's fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoute {
    pub source: String,
    pub id: String,
}

impl SourceRoute {
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }
}

/// Config form of a symbol override (`[symbols.BTC]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolSpec {
    pub sources: Vec<SourceRoute>,
    /// Fixed USD price for pegged assets, as a decimal string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub symbol: String,
    pub routes: Vec<SourceRoute>,
    /// Pegged symbols never touch the network.
    pub peg: Option<Decimal>,
}

/// Immutable symbol → routes table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: BTreeMap<String, SymbolEntry>,
}

fn routes(pairs: &[(&str, &str)]) -> Vec<SourceRoute> {
    pairs
        .iter()
        .map(|(source, id)| SourceRoute::new(*source, *id))
        .collect()
}

impl SymbolTable {
    /// Built-in routes. Chain-specific sources first, then the aggregators,
    /// then exchange tickers.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(SymbolEntry {
            symbol: "BTC".to_string(),
            routes: routes(&[
                ("mempool", "USD"),
                ("coingecko", "bitcoin"),
                ("coincap", "bitcoin"),
                ("cryptocompare", "BTC"),
                ("binance", "BTCUSDT"),
            ]),
            peg: None,
        });
        table.insert(SymbolEntry {
            symbol: "ETH".to_string(),
            routes: routes(&[
                ("coingecko", "ethereum"),
                ("coincap", "ethereum"),
                ("cryptocompare", "ETH"),
                ("binance", "ETHUSDT"),
            ]),
            peg: None,
        });
        table.insert(SymbolEntry {
            symbol: "SOL".to_string(),
            routes: routes(&[
                ("coingecko", "solana"),
                ("coincap", "solana"),
                ("cryptocompare", "SOL"),
                ("binance", "SOLUSDT"),
            ]),
            peg: None,
        });
        table.insert(SymbolEntry {
            symbol: "XMR".to_string(),
            routes: routes(&[
                ("coingecko", "monero"),
                ("coincap", "monero"),
                ("cryptocompare", "XMR"),
            ]),
            peg: None,
        });
        table.insert(SymbolEntry {
            symbol: "USDC".to_string(),
            routes: Vec::new(),
            peg: Some(Decimal::ONE),
        });
        table
    }

    /// Apply config overrides. An override with `sources` replaces the routes;
    /// one with `peg` pegs the symbol. New symbols are added.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, SymbolSpec>) -> Result<Self> {
        for (raw_symbol, spec) in overrides {
            let symbol = normalize_symbol(raw_symbol);
            if symbol.is_empty() {
                bail!("symbol override with empty name");
            }

            let peg = spec
                .peg
                .as_deref()
                .map(|raw| -> Result<Decimal> {
                    let value = Decimal::from_str(raw.trim())
                        .with_context(|| format!("Invalid peg for {symbol}: {raw}"))?;
                    if value <= Decimal::ZERO {
                        bail!("Peg for {symbol} must be positive, got {raw}");
                    }
                    Ok(value)
                })
                .transpose()?;

            let entry = self
                .entries
                .entry(symbol.clone())
                .or_insert_with(|| SymbolEntry {
                    symbol: symbol.clone(),
                    routes: Vec::new(),
                    peg: None,
                });
            if !spec.sources.is_empty() {
                entry.routes = spec.sources.clone();
            }
            if peg.is_some() {
                entry.peg = peg;
            }
        }
        Ok(self)
    }

    pub fn insert(&mut self, entry: SymbolEntry) {
        let symbol = normalize_symbol(&entry.symbol);
        self.entries.insert(
            symbol.clone(),
            SymbolEntry {
                symbol,
                ..entry
            },
        );
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolEntry> {
        self.entries.get(&normalize_symbol(symbol))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Identifier used by `source` for `symbol`, if that source is routed.
    pub fn id_for(&self, symbol: &str, source: &str) -> Option<&str> {
        self.get(symbol)?
            .routes
            .iter()
            .find(|route| route.source == source)
            .map(|route| route.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_default_symbols() {
        let table = SymbolTable::builtin();
        let symbols: Vec<&str> = table.symbols().collect();
        assert_eq!(symbols, vec!["BTC", "ETH", "SOL", "USDC", "XMR"]);
    }

    #[test]
    fn builtin_ids_per_source() {
        let table = SymbolTable::builtin();
        assert_eq!(table.id_for("btc", "coingecko"), Some("bitcoin"));
        assert_eq!(table.id_for("BTC", "binance"), Some("BTCUSDT"));
        assert_eq!(table.id_for("XMR", "binance"), None);
        assert_eq!(table.get("BTC").unwrap().routes[0].source, "mempool");
    }

    #[test]
    fn usdc_is_pegged_without_routes() {
        let table = SymbolTable::builtin();
        let usdc = table.get("USDC").unwrap();
        assert_eq!(usdc.peg, Some(Decimal::ONE));
        assert!(usdc.routes.is_empty());
    }

    #[test]
    fn overrides_replace_routes_and_add_symbols() -> Result<()> {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "btc".to_string(),
            SymbolSpec {
                sources: vec![SourceRoute::new("binance", "BTCUSDC")],
                peg: None,
            },
        );
        overrides.insert(
            "DOGE".to_string(),
            SymbolSpec {
                sources: vec![SourceRoute::new("coingecko", "dogecoin")],
                peg: None,
            },
        );
        overrides.insert(
            "DAI".to_string(),
            SymbolSpec {
                sources: Vec::new(),
                peg: Some("1.00".to_string()),
            },
        );

        let table = SymbolTable::builtin().with_overrides(&overrides)?;
        assert_eq!(table.get("BTC").unwrap().routes, vec![SourceRoute::new("binance", "BTCUSDC")]);
        assert_eq!(table.id_for("DOGE", "coingecko"), Some("dogecoin"));
        assert_eq!(table.get("DAI").unwrap().peg, Some(Decimal::ONE));
        Ok(())
    }

    #[test]
    fn invalid_peg_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "USDT".to_string(),
            SymbolSpec {
                sources: Vec::new(),
                peg: Some("0".to_string()),
            },
        );
        assert!(SymbolTable::builtin().with_overrides(&overrides).is_err());

        overrides.insert(
            "USDT".to_string(),
            SymbolSpec {
                sources: Vec::new(),
                peg: Some("one".to_string()),
            },
        );
        assert!(SymbolTable::builtin().with_overrides(&overrides).is_err());
    }
}
