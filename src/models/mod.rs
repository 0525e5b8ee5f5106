use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-assigned identifier for a position or a pending order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-minute OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>, // Minute aligned
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Direction of a position or order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Entry signal produced by the strategy on the latest completed bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Enter(Side),
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Signal,        // Moving-average alignment broke
    ExternalClose, // Broker stop-out or manual intervention outside the engine
    Shutdown,
    Manual,
}

/// A single unit held at the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Ticket,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_volatility: f64, // Volatility estimate when the unit was entered
    pub commission: f64,
    pub swap: f64,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// New open position with no recorded costs
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: Ticket,
        symbol: impl Into<String>,
        side: Side,
        size: f64,
        entry_price: f64,
        stop_price: f64,
        entry_time: DateTime<Utc>,
        entry_volatility: f64,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            side,
            size,
            entry_price,
            stop_price,
            entry_time,
            entry_volatility,
            commission: 0.0,
            swap: 0.0,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            exit_reason: None,
        }
    }

    /// Price P&L at `price`, before commission and swap
    pub fn gross_pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign() * self.size
    }
}

/// Staged add-on order waiting at the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidOrder {
    pub id: Ticket,
    pub parent_position_id: Ticket,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub trigger_price: f64,
    pub stop_price: f64,
}

/// Trading constraints of an instrument as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub tick_size: f64,
    pub tick_value: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self {
            tick_size: 0.01,
            tick_value: 0.01,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
        }
    }
}
