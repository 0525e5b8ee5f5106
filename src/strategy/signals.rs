use crate::config::SignalConfig;
use crate::indicators::{calculate_atr_series, calculate_ema_series};
use crate::models::{Candle, Side, Signal};

/// Indicator columns aligned bar-for-bar with the source window
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorColumns {
    pub ema_short: Vec<Option<f64>>,
    pub ema_mid: Vec<Option<f64>>,
    pub ema_long: Vec<Option<f64>>,
    pub volatility: Vec<Option<f64>>,
}

/// A window snapshot with indicators attached when warm-up is satisfied
#[derive(Debug, Clone)]
pub struct IndicatorFrame<'a> {
    pub candles: &'a [Candle],
    pub columns: Option<IndicatorColumns>,
}

/// Values of every indicator on the most recent bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestIndicators {
    pub ema_short: f64,
    pub ema_mid: f64,
    pub ema_long: f64,
    pub volatility: f64,
}

impl IndicatorFrame<'_> {
    pub fn is_warm(&self) -> bool {
        self.columns.is_some()
    }

    pub fn latest(&self) -> Option<LatestIndicators> {
        let columns = self.columns.as_ref()?;
        Some(LatestIndicators {
            ema_short: (*columns.ema_short.last()?)?,
            ema_mid: (*columns.ema_mid.last()?)?,
            ema_long: (*columns.ema_long.last()?)?,
            volatility: (*columns.volatility.last()?)?,
        })
    }
}

/// Moving-average alignment signals over a candle window
///
/// Stateless: every answer is a pure function of the window passed in.
#[derive(Debug, Clone)]
pub struct SignalEngine {
    short_ma: usize,
    mid_ma: usize,
    long_ma: usize,
    volatility_period: usize,
    warmup_bars: usize,
}

impl SignalEngine {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            short_ma: config.short_ma,
            mid_ma: config.mid_ma,
            long_ma: config.long_ma,
            volatility_period: config.volatility_period,
            warmup_bars: config.warmup_bars,
        }
    }

    pub fn warmup_bars(&self) -> usize {
        self.warmup_bars
    }

    /// Compute EMA and volatility columns, or none below warm-up
    pub fn indicators<'a>(&self, candles: &'a [Candle]) -> IndicatorFrame<'a> {
        if candles.len() < self.warmup_bars {
            return IndicatorFrame {
                candles,
                columns: None,
            };
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        IndicatorFrame {
            candles,
            columns: Some(IndicatorColumns {
                ema_short: calculate_ema_series(&closes, self.short_ma),
                ema_mid: calculate_ema_series(&closes, self.mid_ma),
                ema_long: calculate_ema_series(&closes, self.long_ma),
                volatility: calculate_atr_series(candles, self.volatility_period),
            }),
        }
    }

    /// Long on bullish alignment, Short on bearish alignment, else Hold
    pub fn entry_signal(&self, candles: &[Candle]) -> Signal {
        let Some(latest) = self.indicators(candles).latest() else {
            return Signal::Hold;
        };

        if latest.ema_short > latest.ema_mid && latest.ema_mid > latest.ema_long {
            Signal::Enter(Side::Long)
        } else if latest.ema_short < latest.ema_mid && latest.ema_mid < latest.ema_long {
            Signal::Enter(Side::Short)
        } else {
            Signal::Hold
        }
    }

    /// True when the short average has crossed back through the mid average
    pub fn exit_signal(&self, candles: &[Candle], side: Side) -> bool {
        let Some(latest) = self.indicators(candles).latest() else {
            return false;
        };

        match side {
            Side::Long => latest.ema_short < latest.ema_mid,
            Side::Short => latest.ema_short > latest.ema_mid,
        }
    }

    /// Volatility estimate on the most recent bar
    pub fn volatility(&self, candles: &[Candle]) -> Option<f64> {
        self.indicators(candles).latest().map(|l| l.volatility)
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new(&SignalConfig::default())
    }
}
