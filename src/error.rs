use crate::models::Ticket;
use thiserror::Error;

/// Failures surfaced by a broker call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Terminal or venue could not be reached; safe to retry
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Venue answered and declined the request
    #[error("request rejected (code {code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Engine-level failure taxonomy. None of these stop the trading loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("connectivity failure during {operation}: {reason}")]
    ConnectivityFailure { operation: String, reason: String },

    #[error("data integrity failure for {symbol}: {reason}")]
    DataIntegrityFailure { symbol: String, reason: String },

    #[error("unit capacity exceeded for {symbol} ({symbol_units} on symbol, {total_units} total)")]
    CapacityExceeded {
        symbol: String,
        symbol_units: usize,
        total_units: usize,
    },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("{symbol} has no open position {id}")]
    NotFound { symbol: String, id: Ticket },
}

impl EngineError {
    pub(crate) fn from_broker(operation: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(reason) => EngineError::ConnectivityFailure {
                operation: operation.to_string(),
                reason,
            },
            BrokerError::Rejected { code, message } => {
                EngineError::OrderRejected(format!("{operation}: {message} (code {code})"))
            }
            BrokerError::UnknownTicket(id) => {
                EngineError::OrderRejected(format!("{operation}: unknown ticket {id}"))
            }
        }
    }
}
