use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::{Config, MarketData, MarketsFileConfig, OrderGateway, TradingMode};
use engine::{DydxClient, ExecutionEngine, Scheduler};
use journal::TradeJournal;
use paper::PaperGateway;

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(mode = %cfg.trading_mode, "DipBot starting");

    let markets_file = MarketsFileConfig::load(&cfg.markets_config_path);
    let settings = markets_file.engine.clone();
    let markets = markets_file.resolved_markets();
    info!(
        markets = markets.len(),
        lookback = settings.lookback,
        allocation_fraction = settings.allocation_fraction,
        "Markets config loaded"
    );

    // ── Exchange client ───────────────────────────────────────────────────────
    // Candles always come from the exchange's public API; only order flow
    // is switched between live and paper.
    let client = Arc::new(DydxClient::new(
        &cfg.dydx_api_key,
        &cfg.dydx_api_secret,
        &cfg.dydx_passphrase,
        Duration::from_secs(settings.order_timeout_secs),
    ));
    let market_data: Arc<dyn MarketData> = client.clone();

    let gateway: Arc<dyn OrderGateway> = match cfg.trading_mode {
        TradingMode::Live => {
            info!("Live trading mode — orders go to the exchange");
            client
        }
        TradingMode::Paper => {
            info!(
                balance = cfg.paper_balance_usd,
                slippage_bps = cfg.paper_slippage_bps,
                "Paper trading mode — orders are simulated"
            );
            Arc::new(PaperGateway::new(
                market_data.clone(),
                cfg.paper_balance_usd,
                cfg.paper_slippage_bps,
            ))
        }
    };

    // ── Journal ───────────────────────────────────────────────────────────────
    let journal = TradeJournal::open(&cfg.journal_path).unwrap_or_else(|e| {
        panic!("Failed to open trade journal at '{}': {e}", cfg.journal_path)
    });

    // ── Engine + scheduler ────────────────────────────────────────────────────
    let execution = ExecutionEngine::new(markets, settings.clone(), market_data, gateway, journal);
    let scheduler = Scheduler::new(execution, &settings);

    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                error!(error = %e, "Scheduling stopped — operator intervention required");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting.");
        }
    }
}
