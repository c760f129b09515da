use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::{self, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::SourceError;

/// Key holding the refresh timestamp in the persisted snapshot object.
const LAST_UPDATED_KEY: &str = "lastUpdated";

/// Canonical form for ticker symbols ("btc " -> "BTC").
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Converts a float into a decimal through its shortest textual form, so `0.1`
/// becomes `0.1` instead of the nearest binary fraction.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_str(&value.to_string()).ok()
}

/// A USD price that is either known or has never been fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Price {
    Known(Decimal),
    #[default]
    Unknown,
}

impl Price {
    /// Only strictly positive values are prices; everything else is `Unknown`.
    pub fn from_decimal(value: Decimal) -> Self {
        if value > Decimal::ZERO {
            Price::Known(value)
        } else {
            Price::Unknown
        }
    }

    pub fn known(self) -> Option<Decimal> {
        match self {
            Price::Known(value) => Some(value),
            Price::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Price::Known(_))
    }
}

impl From<Option<Decimal>> for Price {
    fn from(value: Option<Decimal>) -> Self {
        value.map(Price::from_decimal).unwrap_or(Price::Unknown)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Known(value) => write!(f, "{}", value.normalize()),
            Price::Unknown => f.write_str("n/a"),
        }
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Price::Known(value) => {
                let value = value
                    .to_f64()
                    .ok_or_else(|| {
                        <S::Error as ser::Error>::custom(format!("price {value} is not representable"))
                    })?;
                serializer.serialize_f64(value)
            }
            Price::Unknown => serializer.serialize_none(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPrice {
    Number(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<RawPrice> = Option::deserialize(deserializer)?;
        let value = match raw {
            None => return Ok(Price::Unknown),
            Some(RawPrice::Number(n)) => decimal_from_f64(n),
            Some(RawPrice::Text(s)) => Decimal::from_str(s.trim()).ok(),
        };
        Ok(Price::from(value))
    }
}

/// The complete set of last-known prices plus the time of the refresh that produced it.
///
/// Serialized as a flat JSON object: `{ "BTC": 50000.0, "ETH": null, "lastUpdated": 1700000000000 }`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriceSnapshot {
    prices: BTreeMap<String, Price>,
    last_updated: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    pub fn new(prices: BTreeMap<String, Price>, last_updated: Option<DateTime<Utc>>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(symbol, price)| (normalize_symbol(&symbol), price))
            .collect();
        Self {
            prices,
            last_updated,
        }
    }

    pub fn with_price(mut self, symbol: &str, price: Price) -> Self {
        self.prices.insert(normalize_symbol(symbol), price);
        self
    }

    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    /// Price for a symbol; symbols that were never tracked are `Unknown`.
    pub fn price(&self, symbol: &str) -> Price {
        self.prices
            .get(&normalize_symbol(symbol))
            .copied()
            .unwrap_or_default()
    }

    pub fn prices(&self) -> &BTreeMap<String, Price> {
        &self.prices
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Age relative to `now`; `None` if the snapshot was never refreshed.
    /// Timestamps from the future count as zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.last_updated
            .map(|at| (now - at).to_std().unwrap_or(std::time::Duration::ZERO))
    }

    pub fn known_count(&self) -> usize {
        self.prices.values().filter(|p| p.is_known()).count()
    }
}

impl Serialize for PriceSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.prices.len() + 1))?;
        for (symbol, price) in &self.prices {
            map.serialize_entry(symbol, price)?;
        }
        map.serialize_entry(
            LAST_UPDATED_KEY,
            &self.last_updated.map(|at| at.timestamp_millis()),
        )?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for PriceSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnapshotVisitor;

        impl<'de> Visitor<'de> for SnapshotVisitor {
            type Value = PriceSnapshot;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of symbol prices with a lastUpdated timestamp")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut prices = BTreeMap::new();
                let mut last_updated = None;

                while let Some(key) = access.next_key::<String>()? {
                    if key == LAST_UPDATED_KEY {
                        let millis: Option<i64> = access.next_value()?;
                        last_updated = match millis {
                            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                                <A::Error as de::Error>::custom(format!(
                                    "lastUpdated out of range: {ms}"
                                ))
                            })?),
                            None => None,
                        };
                    } else {
                        let price: Price = access.next_value()?;
                        prices.insert(normalize_symbol(&key), price);
                    }
                }

                Ok(PriceSnapshot {
                    prices,
                    last_updated,
                })
            }
        }

        deserializer.deserialize_map(SnapshotVisitor)
    }
}

/// Outcome of one (symbol, source) attempt. Transient; only kept for logging and reports.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResult {
    pub symbol: String,
    pub source: String,
    pub outcome: Result<Decimal, SourceError>,
}

/// How a symbol was resolved during one refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A source returned a valid price.
    Fetched { price: Decimal, source: String },
    /// Policy price for a pegged stablecoin; no network call was made.
    Pegged(Decimal),
    /// Every configured source failed (or none was configured).
    Unresolved,
}

impl Resolution {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            Resolution::Fetched { price, .. } => Some(*price),
            Resolution::Pegged(price) => Some(*price),
            Resolution::Unresolved => None,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Resolution::Fetched { source, .. } => source,
            Resolution::Pegged(_) => "peg",
            Resolution::Unresolved => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolResolution {
    pub symbol: String,
    pub resolution: Resolution,
    pub attempts: Vec<SourceResult>,
}

impl SymbolResolution {
    pub fn unresolved(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: Resolution::Unresolved,
            attempts: Vec::new(),
        }
    }
}

/// A price handed to the asset store, one JSONL line per write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub price: String,
    pub quote_currency: String,
    pub timestamp: DateTime<Utc>,
}
