use std::sync::Arc;

use super::position_ledger::{PositionLedger, UnitCounts};
use crate::models::{Candle, ExitReason, Side, Signal};
use crate::strategy::Strategy;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Enter { side: Side },
    CloseAll { side: Side, exit_reason: ExitReason },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Turns strategy output into one action per symbol per cycle
///
/// Exits are checked before entries. New entries are only taken when the
/// symbol is flat; adding to a position is left to the staged add-on orders.
pub struct Executor {
    ledger: Arc<PositionLedger>,
}

impl Executor {
    pub fn new(ledger: Arc<PositionLedger>) -> Self {
        Self { ledger }
    }

    /// Decide what to do for `symbol` given its completed-bar window
    ///
    /// # Arguments
    /// * `broker_units` - Live unit counts from the broker, a floor for the cap check
    pub fn process_signal(
        &self,
        symbol: &str,
        candles: &[Candle],
        strategy: &dyn Strategy,
        broker_units: UnitCounts,
    ) -> ExecutionDecision {
        if candles.len() < strategy.min_candles_required() {
            return ExecutionDecision::skip(format!(
                "Warming up: {} of {} bars",
                candles.len(),
                strategy.min_candles_required()
            ));
        }

        let open = self.ledger.open_positions(symbol);
        if let Some(first) = open.first() {
            let side = first.side;
            if strategy.exit_signal(candles, side) {
                return ExecutionDecision {
                    action: ExecutionAction::CloseAll {
                        side,
                        exit_reason: ExitReason::Signal,
                    },
                    reason: format!("{} alignment broken with {} units open", side, open.len()),
                };
            }
            return ExecutionDecision::skip(format!("Holding {} units {}", open.len(), side));
        }

        match strategy.entry_signal(candles) {
            Signal::Hold => ExecutionDecision::skip("Hold signal"),
            Signal::Enter(side) => {
                if !self.ledger.can_open_with_broker(symbol, broker_units) {
                    return ExecutionDecision::skip(format!("{} signal but unit caps reached", side));
                }
                ExecutionDecision {
                    action: ExecutionAction::Enter { side },
                    reason: format!("{} alignment on flat symbol", side),
                }
            }
        }
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }
}
