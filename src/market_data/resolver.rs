//! Multi-source resolution.
//!
//! Each symbol walks its route list in order until a source returns a valid
//! price. Symbols are resolved together: at every step the pending symbols are
//! grouped by the source they are about to try, the groups run concurrently,
//! and batch-capable sources get one request per group.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{
    normalize_symbol, validate_price, PriceSource, Resolution, SourceError, SourceResult,
    SourceRoute, SymbolResolution, SymbolTable,
};

pub struct PriceResolver {
    sources: HashMap<String, Arc<dyn PriceSource>>,
    symbols: SymbolTable,
}

/// A symbol still walking its route list.
struct Pending {
    symbol: String,
    routes: Vec<SourceRoute>,
    next: usize,
    attempts: Vec<SourceResult>,
}

impl Pending {
    fn route(&self) -> Option<&SourceRoute> {
        self.routes.get(self.next)
    }

    fn record(&mut self, source: &str, outcome: Result<Decimal, SourceError>) {
        self.attempts.push(SourceResult {
            symbol: self.symbol.clone(),
            source: source.to_string(),
            outcome,
        });
    }

    fn finish(self, resolution: Resolution) -> SymbolResolution {
        SymbolResolution {
            symbol: self.symbol,
            resolution,
            attempts: self.attempts,
        }
    }
}

impl PriceResolver {
    pub fn new(symbols: SymbolTable) -> Self {
        Self {
            sources: HashMap::new(),
            symbols,
        }
    }

    /// Register a source under its [`PriceSource::name`]. A later source with
    /// the same name replaces the earlier one.
    pub fn with_source(mut self, source: Arc<dyn PriceSource>) -> Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn PriceSource>>) -> Self {
        for source in sources {
            self = self.with_source(source);
        }
        self
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn resolve(&self, symbol: &str) -> SymbolResolution {
        let symbol = normalize_symbol(symbol);
        self.resolve_all(std::slice::from_ref(&symbol))
            .await
            .remove(&symbol)
            .unwrap_or_else(|| SymbolResolution::unresolved(symbol))
    }

    /// Resolve every symbol. Never fails: each symbol ends up fetched,
    /// pegged, or unresolved.
    pub async fn resolve_all(&self, symbols: &[String]) -> BTreeMap<String, SymbolResolution> {
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();

        for raw in symbols {
            let symbol = normalize_symbol(raw);
            if symbol.is_empty() || results.contains_key(&symbol) {
                continue;
            }
            if pending.iter().any(|p: &Pending| p.symbol == symbol) {
                continue;
            }

            match self.symbols.get(&symbol) {
                Some(entry) if entry.peg.is_some() => {
                    let peg = entry.peg.unwrap_or(Decimal::ONE);
                    results.insert(
                        symbol.clone(),
                        SymbolResolution {
                            symbol,
                            resolution: Resolution::Pegged(peg),
                            attempts: Vec::new(),
                        },
                    );
                }
                Some(entry) => pending.push(Pending {
                    symbol,
                    routes: entry.routes.clone(),
                    next: 0,
                    attempts: Vec::new(),
                }),
                None => {
                    warn!(symbol = %symbol, "no price routes configured for symbol");
                    results.insert(symbol.clone(), SymbolResolution::unresolved(symbol));
                }
            }
        }

        while !pending.is_empty() {
            let mut groups: BTreeMap<String, Vec<Pending>> = BTreeMap::new();

            for mut p in pending.drain(..) {
                while let Some(route) = p.route() {
                    if self.sources.contains_key(&route.source) {
                        break;
                    }
                    debug!(
                        symbol = %p.symbol,
                        source = %route.source,
                        "price source not enabled; skipping"
                    );
                    p.next += 1;
                }

                match p.route() {
                    Some(route) => groups.entry(route.source.clone()).or_default().push(p),
                    None => {
                        warn!(
                            symbol = %p.symbol,
                            attempts = p.attempts.len(),
                            "all price sources failed; keeping previous value"
                        );
                        results.insert(p.symbol.clone(), p.finish(Resolution::Unresolved));
                    }
                }
            }

            let rounds = groups.into_iter().filter_map(|(name, members)| {
                let source = self.sources.get(&name)?.clone();
                Some(fetch_group(source, members))
            });

            for (mut p, outcome) in join_all(rounds).await.into_iter().flatten() {
                let source = p
                    .route()
                    .map(|route| route.source.clone())
                    .unwrap_or_default();
                p.record(&source, outcome.clone());

                match outcome {
                    Ok(price) => {
                        debug!(symbol = %p.symbol, source = %source, price = %price, "price resolved");
                        results.insert(
                            p.symbol.clone(),
                            p.finish(Resolution::Fetched { price, source }),
                        );
                    }
                    Err(e) => {
                        debug!(
                            symbol = %p.symbol,
                            source = %source,
                            kind = e.kind(),
                            error = %e,
                            "price source failed; trying next"
                        );
                        p.next += 1;
                        pending.push(p);
                    }
                }
            }
        }

        results
    }
}

/// Fetch one group of symbols that all route to `source` at this step.
async fn fetch_group(
    source: Arc<dyn PriceSource>,
    members: Vec<Pending>,
) -> Vec<(Pending, Result<Decimal, SourceError>)> {
    let ids: Vec<String> = members
        .iter()
        .filter_map(|p| p.route().map(|route| route.id.clone()))
        .collect();

    if source.supports_batch() && members.len() > 1 {
        let batch = guarded(source.fetch_prices(&ids)).await;
        return members
            .into_iter()
            .map(|p| {
                let outcome = match &batch {
                    Ok(prices) => {
                        let id = p.route().map(|route| route.id.as_str()).unwrap_or_default();
                        prices
                            .get(id)
                            .copied()
                            .ok_or_else(|| SourceError::Unsupported(format!("{id} missing from batch")))
                            .and_then(validate_price)
                    }
                    Err(e) => Err(e.clone()),
                };
                (p, outcome)
            })
            .collect();
    }

    let calls = members.into_iter().map(|p| {
        let source = source.clone();
        async move {
            let id = p.route().map(|route| route.id.clone()).unwrap_or_default();
            let outcome = guarded(source.fetch_price(&id))
                .await
                .and_then(validate_price);
            (p, outcome)
        }
    });
    join_all(calls).await
}

/// Run a source call, turning a panic inside it into a [`SourceError`].
async fn guarded<T, F>(call: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(SourceError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
