//! Binance spot ticker source.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::market_data::http::{BackoffPolicy, RetryingClient};
use crate::market_data::{parse_price_value, PriceSource, SourceError};

pub const BINANCE_API_BASE: &str = "https://api.binance.com";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[allow(dead_code)]
    symbol: String,
    price: serde_json::Value,
}

/// Binance exchange ticker. Identifiers are trading pairs ("BTCUSDT").
///
/// USDT pairs are treated as USD. Unknown pairs come back as HTTP 400, which
/// surfaces as a status error.
pub struct BinancePriceSource {
    http: RetryingClient,
}

impl BinancePriceSource {
    pub fn new() -> Self {
        Self {
            http: RetryingClient::new("binance", BINANCE_API_BASE),
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

impl Default for BinancePriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PriceSource for BinancePriceSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        let ticker: TickerPrice = self
            .http
            .get_json("/api/v3/ticker/price", &[("symbol", id)])
            .await?;
        parse_price_value(&ticker.price)
    }

    fn name(&self) -> &str {
        "binance"
    }
}
