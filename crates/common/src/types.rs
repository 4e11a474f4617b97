use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One closed hourly candlestick for a single market.
/// Immutable once produced; sequences are ordered ascending by `open_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Start time of the hour this candle covers.
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Definitive result of a market order submission within the bounded
/// confirmation wait. `Pending` means no fill or rejection arrived in time;
/// the caller must re-query account state before trusting its own belief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderOutcome {
    Filled { price: f64, quantity: f64 },
    Rejected { reason: String },
    Pending,
}

/// An open long position. The engine holds at most one system-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Free quote-currency collateral, fetched fresh every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub available: f64,
    pub currency: String,
}

/// Per-market configuration: trigger threshold and order constraints.
/// The order of `MarketSpec`s in the loaded list is the fixed enumeration
/// order used for deterministic candidate tie-breaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSpec {
    pub symbol: String,
    /// Relative drop (e.g. 0.015 = 1.5%) that triggers an entry.
    pub drop_threshold: f64,
    /// Smallest order quantity increment the exchange accepts.
    pub step_size: f64,
    /// Smallest order quantity the exchange accepts.
    pub min_order_size: f64,
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Kind of a trade-journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Open,
    Close,
    Noop,
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Open => write!(f, "OPEN"),
            EventKind::Close => write!(f, "CLOSE"),
            EventKind::Noop => write!(f, "NOOP"),
            EventKind::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the append-only trade/balance journal.
///
/// `balance` and `price` are `None` only when the corresponding exchange
/// query failed; the entry is still written so the journal never misses a
/// transition that occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub symbol: Option<String>,
    pub size: Option<f64>,
    pub price: Option<f64>,
    pub balance: Option<f64>,
    pub note: Option<String>,
}

impl LogEntry {
    pub fn open(symbol: impl Into<String>, size: f64, price: f64, balance: Option<f64>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Open,
            symbol: Some(symbol.into()),
            size: Some(size),
            price: Some(price),
            balance,
            note: None,
        }
    }

    pub fn close(
        symbol: impl Into<String>,
        size: f64,
        price: Option<f64>,
        balance: Option<f64>,
        realized_pnl: Option<f64>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Close,
            symbol: Some(symbol.into()),
            size: Some(size),
            price,
            balance,
            note: realized_pnl.map(|pnl| format!("pnl={pnl:.2}")),
        }
    }

    pub fn noop(balance: f64, note: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Noop,
            symbol: None,
            size: None,
            price: None,
            balance: Some(balance),
            note,
        }
    }

    pub fn error(symbol: Option<&str>, balance: Option<f64>, note: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Error,
            symbol: symbol.map(str::to_string),
            size: None,
            price: None,
            balance,
            note: Some(note.into()),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.kind
        )?;
        if let Some(symbol) = &self.symbol {
            write!(f, " {symbol}")?;
        }
        if let Some(size) = self.size {
            write!(f, " size={size}")?;
        }
        if let Some(price) = self.price {
            write!(f, " price={price:.4}")?;
        }
        match self.balance {
            Some(balance) => write!(f, " balance={balance:.2}")?,
            None => write!(f, " balance=?")?,
        }
        if let Some(note) = &self.note {
            write!(f, " {note}")?;
        }
        Ok(())
    }
}
