//! CryptoCompare price source.
//!
//! Docs: https://min-api.cryptocompare.com/

use std::collections::HashMap;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::market_data::http::{BackoffPolicy, RetryingClient};
use crate::market_data::{parse_price_value, PriceSource, SourceError};

pub const CRYPTOCOMPARE_API_BASE: &str = "https://min-api.cryptocompare.com";

/// CryptoCompare aggregator. Identifiers are ticker symbols ("BTC", "XMR").
///
/// Errors come back as HTTP 200 with `{"Response": "Error", "Message": ...}`,
/// so every body is checked before it is read as prices.
pub struct CryptoComparePriceSource {
    http: RetryingClient,
}

impl CryptoComparePriceSource {
    pub fn new() -> Self {
        Self {
            http: RetryingClient::new("cryptocompare", CRYPTOCOMPARE_API_BASE),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.http = self.http.with_base_url(base_url);
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.http = self.http.with_policy(policy);
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        let header = SecretString::from(format!("Apikey {}", api_key.expose_secret()));
        self.http = self.http.with_auth_header("authorization", header);
        self
    }
}

impl Default for CryptoComparePriceSource {
    fn default() -> Self {
        Self::new()
    }
}

fn check_error_body(body: &Value) -> Result<(), SourceError> {
    if body.get("Response").and_then(Value::as_str) == Some("Error") {
        let message = body
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(SourceError::Unsupported(message.to_string()));
    }
    Ok(())
}

/// `{"USD": 42850.12}`
fn parse_single(body: &Value) -> Result<Decimal, SourceError> {
    check_error_body(body)?;
    let raw = body
        .get("USD")
        .ok_or_else(|| SourceError::Malformed("cryptocompare response missing USD".to_string()))?;
    parse_price_value(raw)
}

/// `{"BTC": {"USD": 42850.12}, "ETH": {"USD": 2534.89}}`
fn parse_multi(body: &Value) -> Result<HashMap<String, Decimal>, SourceError> {
    check_error_body(body)?;
    let entries = body
        .as_object()
        .ok_or_else(|| SourceError::Malformed("cryptocompare response is not an object".to_string()))?;

    let mut prices = HashMap::new();
    for (symbol, quotes) in entries {
        let Some(raw) = quotes.get("USD") else {
            continue;
        };
        match parse_price_value(raw) {
            Ok(price) => {
                prices.insert(symbol.clone(), price);
            }
            Err(e) => debug!(symbol = %symbol, error = %e, "cryptocompare returned unusable price"),
        }
    }
    Ok(prices)
}

#[async_trait::async_trait]
impl PriceSource for CryptoComparePriceSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        let body: Value = self
            .http
            .get_json("/data/price", &[("fsym", id), ("tsyms", "USD")])
            .await?;
        parse_single(&body)
    }

    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, Decimal>, SourceError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = ids.join(",");
        let body: Value = self
            .http
            .get_json(
                "/data/pricemulti",
                &[("fsyms", joined.as_str()), ("tsyms", "USD")],
            )
            .await?;
        parse_multi(&body)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "cryptocompare"
    }
}
