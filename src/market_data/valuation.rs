use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{normalize_symbol, PriceSnapshot};

/// A quantity of one asset held across wallets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holding {
    pub symbol: String,
    pub quantity: Decimal,
}

impl Holding {
    pub fn new(symbol: &str, quantity: Decimal) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            quantity,
        }
    }
}

/// Parse `SYMBOL=QUANTITY` (e.g. `btc=0.5`).
pub fn parse_holding(s: &str) -> Result<Holding> {
    let Some((symbol, quantity)) = s.split_once('=') else {
        bail!("Expected SYMBOL=QUANTITY, got '{s}'");
    };
    let symbol = symbol.trim();
    if symbol.is_empty() {
        bail!("Missing symbol in '{s}'");
    }
    let quantity = Decimal::from_str(quantity.trim())
        .with_context(|| format!("Invalid quantity in '{s}'"))?;
    if quantity.is_sign_negative() {
        bail!("Quantity must not be negative in '{s}'");
    }
    Ok(Holding::new(symbol, quantity))
}

#[derive(Debug, Clone, Serialize)]
pub struct ValuationLineItem {
    pub symbol: String,
    pub quantity: String,
    pub price: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioValuation {
    pub as_of: Option<DateTime<Utc>>,
    pub quote_currency: String,
    /// Sum over holdings with a known price.
    pub total: String,
    pub line_items: Vec<ValuationLineItem>,
    pub unpriced: Vec<String>,
}

/// Value holdings against one snapshot. Holdings of the same symbol are
/// summed; symbols without a known price are listed in `unpriced` and left
/// out of the total.
pub fn value_holdings(snapshot: &PriceSnapshot, holdings: &[Holding]) -> PortfolioValuation {
    let mut merged: Vec<Holding> = Vec::new();
    for holding in holdings {
        match merged.iter_mut().find(|h| h.symbol == holding.symbol) {
            Some(existing) => existing.quantity += holding.quantity,
            None => merged.push(holding.clone()),
        }
    }

    let mut total = Decimal::ZERO;
    let mut line_items = Vec::with_capacity(merged.len());
    let mut unpriced = Vec::new();

    for holding in merged {
        let price = snapshot.price(&holding.symbol).known();
        let value = price.map(|p| (p * holding.quantity).round_dp(2));
        match value {
            Some(v) => total += v,
            None => unpriced.push(holding.symbol.clone()),
        }
        line_items.push(ValuationLineItem {
            symbol: holding.symbol,
            quantity: holding.quantity.normalize().to_string(),
            price: price.map(|p| p.normalize().to_string()),
            value: value.map(|v| v.normalize().to_string()),
        });
    }

    PortfolioValuation {
        as_of: snapshot.last_updated(),
        quote_currency: "USD".to_string(),
        total: total.normalize().to_string(),
        line_items,
        unpriced,
    }
}
