//! Average True Range (ATR) volatility estimate
//!
//! True Range is the greatest of:
//! - Current High - Current Low
//! - Abs(Current High - Previous Close)
//! - Abs(Current Low - Previous Close)
//!
//! The first bar has no previous close, so its range is High - Low.
//! Smoothing is exponential (SMA seed, then `2 / (period + 1)`), which keeps
//! the estimate responsive on one-minute bars.

use super::moving_average::calculate_ema_series;
use crate::models::Candle;

/// True range of every candle, aligned with the input
pub fn true_range_series(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let range = candle.high - candle.low;
            if i == 0 {
                return range;
            }
            let prev_close = candles[i - 1].close;
            range
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs())
        })
        .collect()
}

/// ATR series aligned with `candles`; `None` until `period` ranges exist
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    calculate_ema_series(&true_range_series(candles), period)
}

/// Current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period).last().copied().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 10, 29, 9, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                open_time: start + Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_calculate_atr_constant_range() {
        let candles = create_test_candles(&vec![(100.0, 101.0, 99.0, 100.0); 25]);
        let atr = calculate_atr(&candles, 20);

        assert!(atr.is_some());
        assert!((atr.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_true_range_uses_gaps() {
        let candles = create_test_candles(&[
            (100.0, 101.0, 99.0, 100.0),
            (105.0, 106.0, 104.0, 105.0), // gapped up from 100
        ]);

        let ranges = true_range_series(&candles);
        assert_eq!(ranges[0], 2.0);
        assert_eq!(ranges[1], 6.0); // |106 - 100|
    }

    #[test]
    fn test_high_volatility_raises_atr() {
        let mut prices = vec![(100.0, 101.0, 99.0, 100.0); 20];
        prices.extend(vec![(100.0, 110.0, 90.0, 100.0); 5]);

        let candles = create_test_candles(&prices);
        let series = calculate_atr_series(&candles, 20);

        let calm = series[19].unwrap();
        let last = series[24].unwrap();
        assert!(last > calm * 2.0);
    }

    #[test]
    fn test_insufficient_data() {
        let candles = create_test_candles(&[(100.0, 101.0, 99.0, 100.0); 2]);
        assert!(calculate_atr(&candles, 14).is_none());
        assert_eq!(calculate_atr_series(&candles, 14), vec![None, None]);
    }
}
