use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;

use super::{decimal_from_f64, SourceError};

/// One upstream price provider.
///
/// Implementations receive provider-specific identifiers (already mapped from
/// internal symbols) and return validated, strictly positive USD prices.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError>;

    /// Fetch many identifiers at once. Identifiers missing from the returned map
    /// are unavailable from this source.
    ///
    /// The default issues one request per identifier; providers with a batch
    /// endpoint override this together with [`PriceSource::supports_batch`].
    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, Decimal>, SourceError> {
        let mut prices = HashMap::new();
        let mut last_error = None;

        for id in ids {
            match self.fetch_price(id).await {
                Ok(price) => {
                    prices.insert(id.clone(), price);
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if prices.is_empty() => Err(e),
            _ => Ok(prices),
        }
    }

    fn supports_batch(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// The single validation boundary for upstream prices: rejects zero, negative
/// and non-numeric values.
pub fn validate_price(value: Decimal) -> Result<Decimal, SourceError> {
    if value > Decimal::ZERO {
        Ok(value)
    } else {
        Err(SourceError::InvalidPrice(value.to_string()))
    }
}

/// Parse a JSON price field, which providers send either as a number or as a
/// numeric string.
pub fn parse_price_value(value: &serde_json::Value) -> Result<Decimal, SourceError> {
    let parsed = match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(decimal_from_f64)
            .ok_or_else(|| SourceError::InvalidPrice(n.to_string()))?,
        serde_json::Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|_| SourceError::InvalidPrice(s.to_string()))?
        }
        serde_json::Value::Null => {
            return Err(SourceError::Malformed("price field is null".to_string()))
        }
        other => {
            return Err(SourceError::Malformed(format!(
                "price field has unexpected type: {other}"
            )))
        }
    };

    validate_price(parsed)
}
