pub mod dydx;
pub mod executor;
pub mod scheduler;
pub mod tracker;

pub use dydx::DydxClient;
pub use executor::{ExecutionEngine, TickOutcome};
pub use scheduler::{until_next_tick, Scheduler};
pub use tracker::PositionTracker;
