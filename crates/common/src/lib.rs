pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use config::{Config, EngineSettings, MarketsFileConfig};
pub use error::{Error, Result};
pub use exchange::{MarketData, OrderGateway};
pub use types::*;
