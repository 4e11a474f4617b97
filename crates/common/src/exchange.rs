use async_trait::async_trait;

use crate::{Balance, Candle, OrderOutcome, OrderSide, Position, Result};

/// Pull-based source of closed hourly candlesticks.
///
/// `DydxClient` implements this against the exchange's public REST API.
/// The adapter makes no freshness guarantee; callers must treat candles
/// older than one tick interval as stale and skip the market.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// The most recent `count` closed hourly candles for `symbol`,
    /// ordered oldest first. An error means the market is unavailable
    /// this tick, not that the process should stop.
    async fn latest_candles(&self, symbol: &str, count: usize) -> Result<Vec<Candle>>;
}

/// Abstraction over order placement and account state.
///
/// `DydxClient` implements this for live trading, `PaperGateway` for
/// simulation. Only the `ExecutionEngine` in `crates/engine` submits
/// orders; quantities must already be quantized to the market's step size
/// before they reach the gateway, which does not round.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit a market order and wait a bounded time for confirmation.
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderOutcome>;

    /// Fresh free collateral in the account's quote currency.
    async fn account_balance(&self) -> Result<Balance>;

    /// Open positions as the exchange reports them, for reconciliation.
    async fn open_positions(&self) -> Result<Vec<Position>>;
}
