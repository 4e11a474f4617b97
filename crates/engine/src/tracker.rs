use common::{Error, Position, Result};

/// The engine's belief about the single globally-open position.
///
/// Two states: Flat (no position) and Open (exactly one long). Owned
/// exclusively by the `ExecutionEngine`; nothing else reads or writes it.
/// Holding `Option<Position>` makes a second simultaneous open position
/// unrepresentable.
#[derive(Debug, Default)]
pub struct PositionTracker {
    position: Option<Position>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    /// Record a confirmed open fill. Calling this while a position is
    /// already open is a logic error, not a recoverable condition.
    pub fn record_open(&mut self, position: Position) -> Result<()> {
        if let Some(existing) = &self.position {
            return Err(Error::PositionState(format!(
                "cannot open {} while {} is already open",
                position.symbol, existing.symbol
            )));
        }
        self.position = Some(position);
        Ok(())
    }

    /// Record a confirmed close fill, returning the position that was held.
    pub fn record_close(&mut self) -> Result<Position> {
        self.position
            .take()
            .ok_or_else(|| Error::PositionState("no open position to close".into()))
    }

    /// Replace the belief wholesale with exchange-reported state.
    /// Used only by reconciliation.
    pub fn adopt(&mut self, position: Option<Position>) {
        self.position = position;
    }
}
