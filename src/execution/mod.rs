// Order execution and position bookkeeping
pub mod executor;
pub mod position_ledger;
pub mod pyramid;
pub mod retry;

pub use executor::{ExecutionAction, ExecutionDecision, Executor};
pub use position_ledger::{PositionLedger, UnitCounts, UnitReservation};
pub use pyramid::{PyramidController, StagedLevel};
pub use retry::RetryPolicy;
