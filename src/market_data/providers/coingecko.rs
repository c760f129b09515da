//! CoinGecko price source.
//!
//! Uses the `/simple/price` endpoint, which accepts a comma-separated list of
//! coin ids and returns current prices for all of them in one call.

use std::collections::HashMap;

use rust_decimal::Decimal;
use secrecy::SecretString;
use tracing::debug;

use crate::market_data::http::{BackoffPolicy, RetryingClient};
use crate::market_data::{parse_price_value, PriceSource, SourceError};

pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// `{ "bitcoin": { "usd": 42850.12 }, ... }`
type SimplePriceResponse = HashMap<String, HashMap<String, serde_json::Value>>;

/// CoinGecko aggregator. Identifiers are CoinGecko coin ids ("bitcoin", "monero").
///
/// No API key is required for the public endpoint, though the free tier is
/// heavily rate limited; a demo key raises the limits.
pub struct CoinGeckoPriceSource {
    http: RetryingClient,
    quote_currency: String,
}

impl CoinGeckoPriceSource {
    pub fn new() -> Self {
        Self {
            http: RetryingClient::new("coingecko", COINGECKO_API_BASE),
            quote_currency: "usd".to_string(),
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
        self.http = self.http.with_auth_header("x-cg-demo-api-key", api_key);
        self
    }

    fn extract_prices(&self, response: SimplePriceResponse) -> HashMap<String, Decimal> {
        let mut prices = HashMap::new();
        for (id, quotes) in response {
            let Some(raw) = quotes.get(&self.quote_currency) else {
                debug!(id = %id, "coingecko response missing quote currency");
                continue;
            };
            match parse_price_value(raw) {
                Ok(price) => {
                    prices.insert(id, price);
                }
                Err(e) => debug!(id = %id, error = %e, "coingecko returned unusable price"),
            }
        }
        prices
    }
}

impl Default for CoinGeckoPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PriceSource for CoinGeckoPriceSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        let mut prices = self.fetch_prices(&[id.to_string()]).await?;
        prices
            .remove(id)
            .ok_or_else(|| SourceError::Unsupported(id.to_string()))
    }

    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, Decimal>, SourceError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = ids.join(",");
        let response: SimplePriceResponse = self
            .http
            .get_json(
                "/simple/price",
                &[("ids", joined.as_str()), ("vs_currencies", self.quote_currency.as_str())],
            )
            .await?;

        Ok(self.extract_prices(response))
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}
