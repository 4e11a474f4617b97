use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    Balance, Error, MarketData, OrderGateway, OrderOutcome, OrderSide, Position, Result,
};

const QUOTE_CURRENCY: &str = "USD";

/// Simulated order gateway for paper trading.
///
/// Fills at the market's latest hourly close with configurable slippage.
/// Maintains a simulated quote balance and mirrors the live account model:
/// at most one open position. No real orders are ever sent.
pub struct PaperGateway {
    market_data: Arc<dyn MarketData>,
    balance: RwLock<f64>,
    position: RwLock<Option<Position>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
}

impl PaperGateway {
    pub fn new(market_data: Arc<dyn MarketData>, initial_balance: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance,
            slippage_bps = slippage_bps,
            "PaperGateway initialized"
        );
        Self {
            market_data,
            balance: RwLock::new(initial_balance),
            position: RwLock::new(None),
            slippage_bps,
        }
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let candles = self.market_data.latest_candles(symbol, 1).await?;
        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| Error::Exchange(format!("no price available for {symbol}")))
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderOutcome> {
        let mark = self.mark_price(symbol).await?;

        // Buys pay more, sells receive less.
        let fill_price = match side {
            OrderSide::Buy => mark * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => mark * (1.0 - self.slippage_bps / 10_000.0),
        };

        let mut position = self.position.write().await;
        let mut balance = self.balance.write().await;

        match side {
            OrderSide::Buy => {
                if position.is_some() {
                    return Ok(OrderOutcome::Rejected {
                        reason: "a position is already open".into(),
                    });
                }
                let cost = fill_price * quantity;
                if cost > *balance {
                    return Ok(OrderOutcome::Rejected {
                        reason: format!("insufficient funds: {cost:.2} > {:.2}", *balance),
                    });
                }
                *balance -= cost;
                *position = Some(Position {
                    symbol: symbol.to_string(),
                    size: quantity,
                    entry_price: fill_price,
                    opened_at: Utc::now(),
                });
            }
            OrderSide::Sell => {
                match position.as_ref() {
                    Some(held) if held.symbol == symbol => {}
                    Some(held) => {
                        return Ok(OrderOutcome::Rejected {
                            reason: format!("open position is {}, not {symbol}", held.symbol),
                        });
                    }
                    None => {
                        return Ok(OrderOutcome::Rejected {
                            reason: "no open position to sell".into(),
                        });
                    }
                }
                *balance += fill_price * quantity;
                *position = None;
            }
        }

        debug!(
            symbol = %symbol,
            side = %side,
            mark = mark,
            fill = fill_price,
            qty = quantity,
            "Paper fill simulated"
        );

        Ok(OrderOutcome::Filled {
            price: fill_price,
            quantity,
        })
    }

    async fn account_balance(&self) -> Result<Balance> {
        Ok(Balance {
            available: *self.balance.read().await,
            currency: QUOTE_CURRENCY.to_string(),
        })
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.position.read().await.clone().into_iter().collect())
    }
}
