//! cube_dca - Main Entry Point
//!
//! Runs the execution engine and the management API against either the Cube
//! exchange or the in-process paper exchange.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cube_dca::api::{self, AppState};
use cube_dca::common::clock::SystemClock;
use cube_dca::common::traits::{ExchangeGateway, TradeStore};
use cube_dca::config::{load_config, AppConfig};
use cube_dca::engine::{Engine, EngineContext};
use cube_dca::paper::{FillMode, PaperExchange};
use cube_dca::store::{InMemoryTradeStore, PgTradeStore};
use cube_dca::CubeRestClient;

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CUBE_DCA_CONFIG")]
    config: Option<String>,

    /// Log filter (trace, debug, info, warn, error or a full EnvFilter directive)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Trade against the in-process paper exchange
    #[arg(long)]
    paper: bool,

    /// Management API bind address, overrides `api.bind`
    #[arg(long)]
    bind: Option<String>,
}

fn init_logging(config: &AppConfig, args: &Args) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if args.log_json || config.log.json {
        builder.json().try_init()
    } else {
        builder.with_file(true).with_line_number(true).try_init()
    }
    .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn TradeStore>> {
    match &config.database {
        Some(database) => {
            let store = PgTradeStore::connect(database)
                .await
                .context("connecting to the trade database")?;
            info!("Using PostgreSQL trade store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, trades live in memory only");
            Ok(Arc::new(InMemoryTradeStore::new()))
        }
    }
}

async fn build_gateway(config: &AppConfig, paper: bool) -> Result<Arc<dyn ExchangeGateway>> {
    if paper {
        let exchange = PaperExchange::new(FillMode::Cross);
        for (pair, price) in &config.paper.reference_prices {
            exchange.set_reference_price(pair, *price).await;
        }
        info!(
            pairs = config.paper.reference_prices.len(),
            "Paper trading, no orders reach Cube"
        );
        return Ok(Arc::new(exchange));
    }

    if config.cube.credentials().is_none() {
        warn!("Cube credentials missing, order placement will fail");
    }
    let client = CubeRestClient::new(&config.cube, config.market_catalog())?;
    info!(url = %config.cube.rest_url, "Trading on Cube");
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    init_logging(&config, &args)?;
    config.validate()?;

    info!(
        markets = config.markets.len(),
        paper = args.paper,
        "Starting cube_dca"
    );

    let store = build_store(&config).await?;
    let gateway = build_gateway(&config, args.paper).await?;
    let catalog = config.market_catalog();

    let ctx = Arc::new(EngineContext::new(
        gateway,
        store.clone(),
        catalog.clone(),
        config.engine.clone(),
    ));
    let engine = Engine::start(ctx);

    let state = Arc::new(AppState::new(
        store,
        catalog,
        engine.client(),
        Arc::new(SystemClock),
    ));
    let bind = args.bind.clone().unwrap_or_else(|| config.api.bind.clone());

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let served = api::serve(&bind, state, shutdown).await;
    engine.shutdown().await;
    served?;

    info!("Shutdown complete");
    Ok(())
}
