use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::Candle;
use crate::timing::minute_floor;

/// Why a candle sequence cannot be committed as a window
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WindowViolation {
    #[error("window is empty")]
    Empty,

    #[error("window holds {len} bars, capacity is {capacity}")]
    OverCapacity { len: usize, capacity: usize },

    #[error("only {len} completed bars available, {required} required")]
    InsufficientBars { len: usize, required: usize },

    #[error("open times not strictly increasing at {at}")]
    NotIncreasing { at: DateTime<Utc> },

    #[error("{millis}ms between bars at {at} (expected 60000ms)")]
    BadSpacing { at: DateTime<Utc>, millis: i64 },

    #[error("open time {at} is not on a minute boundary")]
    Misaligned { at: DateTime<Utc> },

    #[error("negative price in bar at {at}")]
    NegativePrice { at: DateTime<Utc> },

    #[error("high ({high}) is less than low ({low}) at {at}")]
    HighBelowLow {
        at: DateTime<Utc>,
        high: f64,
        low: f64,
    },

    #[error("open/close outside high-low range at {at}")]
    BodyOutsideRange { at: DateTime<Utc> },
}

/// Validates one-minute candles and candle sequences
#[derive(Debug, Clone)]
pub struct CandleValidator {
    spacing: Duration,
}

impl CandleValidator {
    pub fn new() -> Self {
        Self {
            spacing: Duration::minutes(1),
        }
    }

    /// Validate a single candle for correctness
    pub fn validate(&self, candle: &Candle) -> Result<(), WindowViolation> {
        if minute_floor(candle.open_time) != candle.open_time {
            return Err(WindowViolation::Misaligned {
                at: candle.open_time,
            });
        }
        self.validate_prices(candle)?;
        self.validate_ohlc_relationship(candle)?;
        Ok(())
    }

    /// Validate a full window: bounds, ordering, spacing, then each bar
    pub fn validate_window(
        &self,
        candles: &[Candle],
        capacity: usize,
    ) -> Result<(), WindowViolation> {
        if candles.is_empty() {
            return Err(WindowViolation::Empty);
        }
        if candles.len() > capacity {
            return Err(WindowViolation::OverCapacity {
                len: candles.len(),
                capacity,
            });
        }

        for pair in candles.windows(2) {
            let step = pair[1].open_time - pair[0].open_time;
            if step <= Duration::zero() {
                return Err(WindowViolation::NotIncreasing {
                    at: pair[1].open_time,
                });
            }
            if step != self.spacing {
                return Err(WindowViolation::BadSpacing {
                    at: pair[1].open_time,
                    millis: step.num_milliseconds(),
                });
            }
        }

        candles.iter().try_for_each(|c| self.validate(c))
    }

    /// Prices may be zero but never negative
    fn validate_prices(&self, candle: &Candle) -> Result<(), WindowViolation> {
        let prices = [candle.open, candle.high, candle.low, candle.close];
        if prices.iter().any(|p| *p < 0.0 || p.is_nan()) || candle.volume < 0.0 {
            return Err(WindowViolation::NegativePrice {
                at: candle.open_time,
            });
        }
        Ok(())
    }

    /// Validate OHLC relationships (high >= low, body inside the range)
    fn validate_ohlc_relationship(&self, candle: &Candle) -> Result<(), WindowViolation> {
        if candle.high < candle.low {
            return Err(WindowViolation::HighBelowLow {
                at: candle.open_time,
                high: candle.high,
                low: candle.low,
            });
        }

        if candle.high < candle.open.max(candle.close) || candle.low > candle.open.min(candle.close)
        {
            return Err(WindowViolation::BodyOutsideRange {
                at: candle.open_time,
            });
        }

        Ok(())
    }
}

impl Default for CandleValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 30, 14, 0, 0).unwrap()
    }

    fn make_valid_candle(minute: i64) -> Candle {
        Candle {
            open_time: t0() + Duration::minutes(minute),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 250.0,
        }
    }

    #[test]
    fn test_valid_candle() {
        let validator = CandleValidator::new();
        assert!(validator.validate(&make_valid_candle(0)).is_ok());
    }

    #[test]
    fn test_zero_volume_allowed() {
        let validator = CandleValidator::new();
        let mut candle = make_valid_candle(0);
        candle.volume = 0.0;
        assert!(validator.validate(&candle).is_ok());
    }

    #[test]
    fn test_negative_low_rejected() {
        let validator = CandleValidator::new();
        let mut candle = make_valid_candle(0);
        candle.low = -1.0;
        assert!(matches!(
            validator.validate(&candle),
            Err(WindowViolation::NegativePrice { .. })
        ));
    }

    #[test]
    fn test_high_below_low_rejected() {
        let validator = CandleValidator::new();
        let mut candle = make_valid_candle(0);
        candle.high = 98.0;
        assert!(matches!(
            validator.validate(&candle),
            Err(WindowViolation::HighBelowLow { .. })
        ));
    }

    #[test]
    fn test_close_above_high_rejected() {
        let validator = CandleValidator::new();
        let mut candle = make_valid_candle(0);
        candle.close = 103.0;
        assert!(matches!(
            validator.validate(&candle),
            Err(WindowViolation::BodyOutsideRange { .. })
        ));
    }

    #[test]
    fn test_window_spacing() {
        let validator = CandleValidator::new();
        let contiguous: Vec<Candle> = (0..5).map(make_valid_candle).collect();
        assert!(validator.validate_window(&contiguous, 60).is_ok());

        let gapped = vec![make_valid_candle(0), make_valid_candle(2)];
        assert!(matches!(
            validator.validate_window(&gapped, 60),
            Err(WindowViolation::BadSpacing { millis: 120_000, .. })
        ));
    }

    #[test]
    fn test_sub_second_spacing_error_rejected() {
        let validator = CandleValidator::new();
        let mut late = make_valid_candle(1);
        late.open_time += Duration::milliseconds(500);

        let pair = [make_valid_candle(0), late];
        assert!(matches!(
            validator.validate_window(&pair, 60),
            Err(WindowViolation::BadSpacing { millis: 60_500, .. })
        ));
        assert!(matches!(
            validator.validate(&pair[1]),
            Err(WindowViolation::Misaligned { .. })
        ));
    }

    #[test]
    fn test_misaligned_open_time_rejected() {
        let validator = CandleValidator::new();
        let mut candle = make_valid_candle(3);
        candle.open_time += Duration::seconds(30);
        assert!(matches!(
            validator.validate(&candle),
            Err(WindowViolation::Misaligned { .. })
        ));

        let window = vec![make_valid_candle(2), candle];
        assert!(matches!(
            validator.validate_window(&window, 60),
            Err(WindowViolation::BadSpacing { millis: 90_000, .. })
        ));
    }

    #[test]
    fn test_window_ordering_and_bounds() {
        let validator = CandleValidator::new();

        let reversed = vec![make_valid_candle(1), make_valid_candle(0)];
        assert!(matches!(
            validator.validate_window(&reversed, 60),
            Err(WindowViolation::NotIncreasing { .. })
        ));

        let duplicate = vec![make_valid_candle(0), make_valid_candle(0)];
        assert!(matches!(
            validator.validate_window(&duplicate, 60),
            Err(WindowViolation::NotIncreasing { .. })
        ));

        assert_eq!(validator.validate_window(&[], 60), Err(WindowViolation::Empty));

        let too_many: Vec<Candle> = (0..3).map(make_valid_candle).collect();
        assert!(matches!(
            validator.validate_window(&too_many, 2),
            Err(WindowViolation::OverCapacity { len: 3, capacity: 2 })
        ));
    }
}
