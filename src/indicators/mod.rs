// Technical indicators module
// EMA and ATR over one-minute candles

pub mod atr;
pub mod moving_average;

pub use atr::{calculate_atr, calculate_atr_series, true_range_series};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
