//! CoinCap price source.
//!
//! Docs: https://docs.coincap.io/

use std::collections::HashMap;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::market_data::http::{BackoffPolicy, RetryingClient};
use crate::market_data::{parse_price_value, PriceSource, SourceError};

pub const COINCAP_API_BASE: &str = "https://api.coincap.io/v2";

#[derive(Debug, Deserialize)]
struct AssetResponse {
    data: CoinCapAsset,
}

#[derive(Debug, Deserialize)]
struct AssetListResponse {
    data: Vec<CoinCapAsset>,
}

#[derive(Debug, Deserialize)]
struct CoinCapAsset {
    id: String,
    #[serde(rename = "priceUsd", default)]
    price_usd: serde_json::Value,
}

/// CoinCap aggregator. Identifiers are CoinCap asset ids ("bitcoin", "solana").
pub struct CoinCapPriceSource {
    http: RetryingClient,
}

impl CoinCapPriceSource {
    pub fn new() -> Self {
        Self {
            http: RetryingClient::new("coincap", COINCAP_API_BASE),
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
        let bearer = SecretString::from(format!("Bearer {}", api_key.expose_secret()));
        self.http = self.http.with_auth_header("Authorization", bearer);
        self
    }
}

impl Default for CoinCapPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PriceSource for CoinCapPriceSource {
    async fn fetch_price(&self, id: &str) -> Result<Decimal, SourceError> {
        let path = format!("/assets/{id}");
        let response: AssetResponse = self.http.get_json(&path, &[]).await?;
        parse_price_value(&response.data.price_usd)
    }

    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, Decimal>, SourceError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = ids.join(",");
        let response: AssetListResponse = self
            .http
            .get_json("/assets", &[("ids", joined.as_str())])
            .await?;

        let mut prices = HashMap::new();
        for asset in response.data {
            match parse_price_value(&asset.price_usd) {
                Ok(price) => {
                    prices.insert(asset.id, price);
                }
                Err(e) => debug!(id = %asset.id, error = %e, "coincap returned unusable price"),
            }
        }
        Ok(prices)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "coincap"
    }
}
