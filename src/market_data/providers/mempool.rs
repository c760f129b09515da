//! mempool.space bitcoin price source.

use rust_decimal::Decimal;
use serde_json::Value;

use crate::market_data::http::{BackoffPolicy, RetryingClient};
use crate::market_data::{parse_price_value, PriceSource, SourceError};

pub const MEMPOOL_API_BASE: &str = "https://mempool.space/api";

/// Bitcoin-only source. `/v1/prices` returns the BTC price in several fiat
/// currencies; the identifier selects the currency key ("USD").
pub struct MempoolPriceSource {
    http: RetryingClient,
}

impl MempoolPriceSource {
    pub fn new() -> Self {
        Self {
            http: RetryingClient::new("mempool", MEMPOOL_API_BASE),
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
}

impl Default for MempoolPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_currency(body: &Value, currency: &str) -> Result<Decimal, SourceError> {
    let raw = body.get(currency).ok_or_else(|| {
        SourceError::Unsupported(format!("mempool has no {currency} price"))
    })?;
    parse_price_value(raw)
}

#[async_trait::async_trait]
impl PriceSource for MempoolPriceSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        let body: Value = self.http.get_json("/v1/prices", &[]).await?;
        extract_currency(&body, &id.to_uppercase())
    }

    fn name(&self) -> &str {
        "mempool"
    }
}
