use common::MarketSpec;
use proptest::prelude::*;
use risk::{CapitalAllocator, Sizing};

proptest! {
    /// Tradable sizes are always step-aligned, at or above the market
    /// minimum, and never commit more than the configured fraction of
    /// available capital.
    #[test]
    fn sized_orders_respect_step_minimum_and_capital(
        available in 0.0f64..1_000_000.0,
        price in 0.01f64..1_000_000.0,
        step_exp in 0i32..6,
        min_steps in 1u32..100,
        fraction in 0.01f64..1.0,
    ) {
        let step = 10f64.powi(-step_exp);
        let spec = MarketSpec {
            symbol: "TEST-USD".into(),
            drop_threshold: 0.01,
            step_size: step,
            min_order_size: step * min_steps as f64,
        };
        let allocator = CapitalAllocator::new(fraction);

        match allocator.size_order(available, price, &spec) {
            Sizing::Trade(qty) => {
                prop_assert!(qty >= spec.min_order_size * (1.0 - 1e-9),
                    "qty {} below minimum {}", qty, spec.min_order_size);

                let steps = qty / step;
                let alignment_tolerance = steps.round().abs() * 1e-12 + 1e-6;
                prop_assert!((steps - steps.round()).abs() <= alignment_tolerance,
                    "qty {} not aligned to step {}", qty, step);

                // Quantizing down can never over-commit by a full step
                let committed = qty * price;
                let budget = available * fraction * (1.0 + 1e-9) + step * price;
                prop_assert!(committed <= budget,
                    "committed {} exceeds budget {}", committed, budget);
            }
            Sizing::NotTradable(_) => {}
        }
    }

    /// Sizing must never panic, whatever the account and market look like.
    #[test]
    fn sizing_never_panics_on_extreme_inputs(
        available in proptest::num::f64::ANY,
        price in proptest::num::f64::ANY,
        step in 1e-8f64..10.0,
    ) {
        let spec = MarketSpec {
            symbol: "TEST-USD".into(),
            drop_threshold: 0.01,
            step_size: step,
            min_order_size: step,
        };
        let allocator = CapitalAllocator::new(0.98);
        let _ = allocator.size_order(available, price, &spec);
    }
}
