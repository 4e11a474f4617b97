use serde::{Deserialize, Serialize};
use tracing::debug;

use common::MarketSpec;

/// Absorbs float division artifacts when counting whole steps
/// (e.g. 0.3 / 0.1 evaluating to 2.999…).
const STEP_EPSILON: f64 = 1e-9;

/// Outcome of sizing a prospective order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sizing {
    /// Quantized quantity, aligned to the market's step size and at or
    /// above its minimum order size.
    Trade(f64),
    /// Capital too small (or inputs unusable) for this market. A normal
    /// outcome, not an error.
    NotTradable(NotTradableReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotTradableReason {
    BelowMinimum { quantized: f64, minimum: f64 },
    NoCapital,
    InvalidPrice { price: f64 },
}

impl std::fmt::Display for NotTradableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotTradableReason::BelowMinimum { quantized, minimum } => {
                write!(f, "quantized size {quantized} below minimum {minimum}")
            }
            NotTradableReason::NoCapital => write!(f, "no free capital"),
            NotTradableReason::InvalidPrice { price } => {
                write!(f, "unusable price {price}")
            }
        }
    }
}

/// Sizes new positions from free balance.
///
/// Commits a configured fraction of available capital, converts the
/// notional to base-asset quantity at the latest close, and quantizes
/// down to the market's step size. The result is what the gateway
/// receives verbatim; the gateway does not round.
#[derive(Debug, Clone)]
pub struct CapitalAllocator {
    allocation_fraction: f64,
}

impl CapitalAllocator {
    pub fn new(allocation_fraction: f64) -> Self {
        assert!(
            allocation_fraction > 0.0 && allocation_fraction <= 1.0,
            "allocation fraction must be in (0, 1], got {allocation_fraction}"
        );
        Self { allocation_fraction }
    }

    pub fn size_order(&self, available: f64, price: f64, spec: &MarketSpec) -> Sizing {
        if !(price > 0.0) || !price.is_finite() {
            return Sizing::NotTradable(NotTradableReason::InvalidPrice { price });
        }

        let notional = available * self.allocation_fraction;
        if !(notional > 0.0) || !notional.is_finite() {
            return Sizing::NotTradable(NotTradableReason::NoCapital);
        }

        let raw_quantity = notional / price;
        let steps = (raw_quantity / spec.step_size + STEP_EPSILON).floor();
        let quantity = steps * spec.step_size;

        if quantity < spec.min_order_size * (1.0 - STEP_EPSILON) {
            return Sizing::NotTradable(NotTradableReason::BelowMinimum {
                quantized: quantity,
                minimum: spec.min_order_size,
            });
        }

        debug!(
            symbol = %spec.symbol,
            notional = notional,
            quantity = quantity,
            "Order sized"
        );
        Sizing::Trade(quantity)
    }
}
