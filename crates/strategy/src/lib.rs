use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::{Candle, MarketSpec};

/// Per-market drop signal for one evaluation tick. Ephemeral: recomputed
/// every tick, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropSignal {
    pub symbol: String,
    /// Relative decline of the latest close versus the reference close.
    /// Negative when the price rose.
    pub drop_fraction: f64,
    pub triggered: bool,
}

impl DropSignal {
    /// Untriggered signal for a market with insufficient data, a normal
    /// quiescent state rather than a failure.
    fn quiescent(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            drop_fraction: 0.0,
            triggered: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluateError {
    #[error("non-positive reference close {reference} for {symbol}")]
    NonPositiveReference { symbol: String, reference: f64 },
}

/// Detects short-term downward price movements in hourly candles.
///
/// Pure function of its input window: identical candles always yield an
/// identical signal. The reference price is the close of the oldest candle
/// in the `lookback`-sized window (lookback = 2 compares against the
/// previous hour's close).
#[derive(Debug, Clone)]
pub struct DropEvaluator {
    pub lookback: usize,
}

impl DropEvaluator {
    pub fn new(lookback: usize) -> Self {
        assert!(lookback >= 2, "drop evaluator lookback must be >= 2");
        Self { lookback }
    }

    /// Evaluate one market's most recent candles, ordered oldest first.
    ///
    /// Fewer than `lookback` candles yields an untriggered signal. A
    /// non-positive reference close is a data-integrity error the caller
    /// must report rather than silently skip.
    pub fn evaluate(
        &self,
        spec: &MarketSpec,
        candles: &[Candle],
    ) -> Result<DropSignal, EvaluateError> {
        if candles.len() < self.lookback {
            return Ok(DropSignal::quiescent(&spec.symbol));
        }

        let current_close = candles[candles.len() - 1].close;
        let reference_close = candles[candles.len() - self.lookback].close;

        if reference_close <= 0.0 {
            return Err(EvaluateError::NonPositiveReference {
                symbol: spec.symbol.clone(),
                reference: reference_close,
            });
        }

        let drop_fraction = (reference_close - current_close) / reference_close;

        Ok(DropSignal {
            symbol: spec.symbol.clone(),
            drop_fraction,
            triggered: drop_fraction >= spec.drop_threshold,
        })
    }
}
