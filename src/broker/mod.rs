// Broker collaborator: the engine's only view of the venue
pub mod paper;

pub use paper::PaperBroker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BrokerError;
use crate::models::{Candle, Side, SymbolSpec, Ticket};
use crate::timing::ServerClock;

/// Position as the broker reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price_open: f64,
    pub stop: Option<f64>,
    pub open_time: DateTime<Utc>,
}

/// Stop-entry order waiting at the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub trigger_price: f64,
    pub stop: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub stop: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopEntryOrder {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub trigger_price: f64,
    pub stop: f64,
}

/// Execution report for a market order or a close
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub ticket: Ticket,
    pub price: f64,
    pub time: DateTime<Utc>,
}

/// Final deal of a closed position from the broker's trade history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosedDeal {
    pub price: f64,
    pub time: DateTime<Utc>,
    pub commission: f64,
    pub swap: f64,
}

/// Synchronous broker terminal
///
/// Every call may block and may fail; callers wrap them in a bounded retry.
pub trait Broker: ServerClock + Send + Sync {
    /// Last `count` one-minute bars, oldest first; the final one is still forming
    fn recent_bars(&self, symbol: &str, count: usize) -> Result<Vec<Candle>, BrokerError>;

    /// Open positions for one symbol, or for the whole account
    fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<BrokerPosition>, BrokerError>;

    fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError>;

    fn submit_market(&self, order: &MarketOrder) -> Result<Fill, BrokerError>;

    fn submit_stop_entry(&self, order: &StopEntryOrder) -> Result<Ticket, BrokerError>;

    fn modify_stop(&self, position: Ticket, stop: f64) -> Result<(), BrokerError>;

    fn cancel_order(&self, order: Ticket) -> Result<(), BrokerError>;

    fn close_position(&self, position: Ticket) -> Result<Fill, BrokerError>;

    /// Closing deal from trade history, if the broker still has it
    fn closing_deal(&self, position: Ticket) -> Result<Option<ClosedDeal>, BrokerError>;

    fn account_equity(&self) -> Result<f64, BrokerError>;

    fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError>;
}

impl<B: ServerClock + ?Sized> ServerClock for Arc<B> {
    fn server_time(&self) -> Result<DateTime<Utc>, BrokerError> {
        (**self).server_time()
    }
}

impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn recent_bars(&self, symbol: &str, count: usize) -> Result<Vec<Candle>, BrokerError> {
        (**self).recent_bars(symbol, count)
    }

    fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<BrokerPosition>, BrokerError> {
        (**self).open_positions(symbol)
    }

    fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError> {
        (**self).pending_orders(symbol)
    }

    fn submit_market(&self, order: &MarketOrder) -> Result<Fill, BrokerError> {
        (**self).submit_market(order)
    }

    fn submit_stop_entry(&self, order: &StopEntryOrder) -> Result<Ticket, BrokerError> {
        (**self).submit_stop_entry(order)
    }

    fn modify_stop(&self, position: Ticket, stop: f64) -> Result<(), BrokerError> {
        (**self).modify_stop(position, stop)
    }

    fn cancel_order(&self, order: Ticket) -> Result<(), BrokerError> {
        (**self).cancel_order(order)
    }

    fn close_position(&self, position: Ticket) -> Result<Fill, BrokerError> {
        (**self).close_position(position)
    }

    fn closing_deal(&self, position: Ticket) -> Result<Option<ClosedDeal>, BrokerError> {
        (**self).closing_deal(position)
    }

    fn account_equity(&self) -> Result<f64, BrokerError> {
        (**self).account_equity()
    }

    fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError> {
        (**self).symbol_spec(symbol)
    }
}
