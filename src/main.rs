use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use walletwatch::config::{default_config_path, ResolvedConfig};
use walletwatch::duration::format_duration;
use walletwatch::market_data::{
    parse_holding, value_holdings, Holding, PriceCache, PriceCacheBuilder, PriceSnapshot,
    SourceKind,
};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    walletwatch::duration::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_holding_arg(s: &str) -> Result<Holding, String> {
    parse_holding(s).map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "walletwatch")]
#[command(about = "Crypto holdings tracker with a stale-while-refresh price cache")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Only use the stored snapshot and pegged prices; make no network calls.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current price snapshot
    Prices {
        /// Wait for a refresh to complete instead of returning cached prices
        #[arg(long)]
        fresh: bool,
    },
    /// Value holdings given as SYMBOL=QUANTITY pairs
    Value {
        #[arg(required = true, value_parser = parse_holding_arg)]
        holdings: Vec<Holding>,

        /// Wait for a refresh to complete before valuing
        #[arg(long)]
        fresh: bool,
    },
    /// Poll the cache periodically, letting stale reads drive background refreshes
    Watch {
        /// Poll interval (e.g. "30s", "1m")
        #[arg(long, default_value = "60s", value_parser = parse_duration_arg)]
        interval: Duration,
    },
    /// Show current configuration
    Config,
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .json(),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}

fn snapshot_json(cache: &PriceCache, snapshot: Option<&PriceSnapshot>) -> serde_json::Value {
    json!({
        "state": cache.state(),
        "prices": snapshot,
    })
}

async fn read_snapshot(cache: &PriceCache, fresh: bool) -> Result<Arc<PriceSnapshot>> {
    let snapshot = if fresh {
        cache.get_fresh_prices().await?
    } else {
        cache.get_prices_or_refresh().await?
    };
    Ok(snapshot)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ResolvedConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load walletwatch config: {}", cli.config.display()))?;

    let Some(command) = cli.command else {
        println!("walletwatch - crypto holdings tracker");
        println!("=====================================\n");
        println!("Config: {}", cli.config.display());
        println!("Data directory: {}\n", config.data_dir.display());
        println!("Commands:");
        println!("  prices    Print the current price snapshot");
        println!("  value     Value holdings (e.g. BTC=0.5 ETH=2)");
        println!("  watch     Keep prices fresh in the background");
        println!("  config    Show current configuration\n");
        println!("Run 'walletwatch --help' for more options.");
        return Ok(());
    };

    match command {
        Command::Prices { fresh } => {
            let cache = build_cache(&config, cli.offline)?;
            let snapshot = read_snapshot(&cache, fresh).await?;
            let output = snapshot_json(&cache, Some(snapshot.as_ref()));
            println!("{}", serde_json::to_string_pretty(&output)?);
            settle(&cache).await;
        }
        Command::Value { holdings, fresh } => {
            let cache = build_cache(&config, cli.offline)?;
            let snapshot = read_snapshot(&cache, fresh).await?;
            let valuation = value_holdings(&snapshot, &holdings);
            if !valuation.unpriced.is_empty() {
                warn!(symbols = ?valuation.unpriced, "some holdings have no known price");
            }
            println!("{}", serde_json::to_string_pretty(&valuation)?);
            settle(&cache).await;
        }
        Command::Watch { interval } => {
            let cache = build_cache(&config, cli.offline)?;
            info!(interval = %format_duration(interval), "watching prices");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = cache.get_prices().await;
                        let output = snapshot_json(&cache, snapshot.as_deref());
                        println!("{}", serde_json::to_string(&output)?);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            settle(&cache).await;
        }
        Command::Config => print_config(&cli.config, &config)?,
    }

    Ok(())
}

fn build_cache(config: &ResolvedConfig, offline: bool) -> Result<PriceCache> {
    let mut builder = PriceCacheBuilder::from_config(config);
    if offline {
        builder = builder.offline_only();
    }
    builder.build()
}

/// Let an in-flight refresh and its queued price log writes finish before
/// the runtime shuts down.
async fn settle(cache: &PriceCache) {
    cache.wait_for_refresh().await;
    cache.flush_asset_writes().await;
}

fn print_config(config_path: &Path, config: &ResolvedConfig) -> Result<()> {
    let sources: Vec<serde_json::Value> = SourceKind::ALL
        .into_iter()
        .map(|kind| {
            let source = config.source(kind);
            json!({
                "name": kind.name(),
                "enabled": source.enabled,
                "base_url": source.base_url.as_deref().unwrap_or(kind.default_base_url()),
                "api_key": source.resolve_api_key().is_some(),
            })
        })
        .collect();

    let symbols = config.symbol_table()?;
    let routes: serde_json::Map<String, serde_json::Value> = symbols
        .symbols()
        .filter_map(|symbol| symbols.get(symbol))
        .map(|entry| {
            let value = match entry.peg {
                Some(peg) => json!({ "peg": peg.to_string() }),
                None => json!({ "sources": entry.routes }),
            };
            (entry.symbol.clone(), value)
        })
        .collect();

    let settings = config.cache.settings();
    let output = json!({
        "config_file": config_path.display().to_string(),
        "data_dir": config.data_dir.display().to_string(),
        "cache": {
            "stale_threshold": format_duration(settings.stale_threshold),
            "snapshot_ttl": format_duration(settings.snapshot_ttl),
            "require_persistence": settings.require_persistence,
            "symbols": settings.symbols,
        },
        "storage": config.storage,
        "sources": sources,
        "symbols": routes,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
