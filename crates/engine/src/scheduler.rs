use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{error, info, warn};

use common::{EngineSettings, Error, Result};

use crate::executor::{ExecutionEngine, TickOutcome};

/// Time until the next tick: the upcoming hour boundary plus the settle
/// delay that lets the exchange finalize the hourly candle.
pub fn until_next_tick(now: DateTime<Utc>, settle: Duration) -> Duration {
    let seconds_into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3600 - seconds_into_hour) + settle
}

/// Counts consecutive gateway-failure ticks and turns the configured limit
/// into a fatal error. A completed tick resets the count; the limit exists
/// to stop blind retrying into a broken credential or connectivity state,
/// not to punish isolated hiccups.
#[derive(Debug)]
struct FailureGate {
    consecutive: u32,
    limit: u32,
}

impl FailureGate {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    fn note(&mut self, outcome: TickOutcome) -> Result<()> {
        match outcome {
            TickOutcome::Completed => {
                self.consecutive = 0;
                Ok(())
            }
            TickOutcome::GatewayFailure => {
                self.consecutive += 1;
                warn!(
                    consecutive = self.consecutive,
                    limit = self.limit,
                    "Tick ended in gateway failure"
                );
                if self.consecutive >= self.limit {
                    Err(Error::GatewayUnavailable(format!(
                        "{} consecutive gateway failures; operator intervention required",
                        self.consecutive
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Drives the engine once per hour, aligned to candle close. Ticks run to
/// completion and never interleave; the only suspension points are the
/// engine's own blocking exchange calls.
pub struct Scheduler {
    engine: ExecutionEngine,
    settle: Duration,
    gate: FailureGate,
}

impl Scheduler {
    pub fn new(engine: ExecutionEngine, settings: &EngineSettings) -> Self {
        Self {
            engine,
            settle: Duration::from_secs(settings.tick_delay_secs),
            gate: FailureGate::new(settings.max_gateway_failures),
        }
    }

    /// Run until a fatal condition stops scheduling. The returned error is
    /// the operator-facing reason.
    pub async fn run(mut self) -> Result<()> {
        info!("Scheduler running");
        loop {
            let wait = until_next_tick(Utc::now(), self.settle);
            info!(wait_secs = wait.as_secs(), "Waiting for next hourly tick");
            tokio::time::sleep(wait).await;

            let outcome = match self.engine.run_tick().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Fatal engine error; scheduling stopped");
                    return Err(e);
                }
            };
            self.gate.note(outcome)?;
        }
    }
}
