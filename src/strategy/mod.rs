// Trading strategy module
pub mod signals;
pub mod trend;

pub use signals::{IndicatorColumns, IndicatorFrame, LatestIndicators, SignalEngine};
pub use trend::TrendStrategy;

use crate::models::{Candle, Side, Signal};

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Entry decision on the most recent completed bar
    fn entry_signal(&self, candles: &[Candle]) -> Signal;

    /// Whether an open position on `side` should be closed
    fn exit_signal(&self, candles: &[Candle], side: Side) -> bool;

    /// Volatility estimate used for stops, sizing and pyramid spacing
    fn volatility(&self, candles: &[Candle]) -> Option<f64>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
