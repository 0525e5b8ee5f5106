use super::{signals::SignalEngine, Strategy};
use crate::config::SignalConfig;
use crate::indicators::{calculate_atr_series, calculate_sma};
use crate::models::{Candle, Side, Signal};

/// Trend-following strategy on moving-average alignment
///
/// Entries follow the signal engine; when filters are enabled, entries on
/// thin volume or on a volatility spike are suppressed. Exits are never
/// filtered.
#[derive(Debug, Clone)]
pub struct TrendStrategy {
    engine: SignalEngine,
    use_entry_filters: bool,
    min_volume_ratio: f64,
    max_volatility_ratio: f64,
    filter_lookback: usize,
    volatility_period: usize,
}

impl TrendStrategy {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            engine: SignalEngine::new(config),
            use_entry_filters: config.use_entry_filters,
            min_volume_ratio: config.min_volume_ratio,
            max_volatility_ratio: config.max_volatility_ratio,
            filter_lookback: config.filter_lookback,
            volatility_period: config.volatility_period,
        }
    }

    pub fn engine(&self) -> &SignalEngine {
        &self.engine
    }

    /// True when the last bar trades well below its recent mean volume
    fn volume_too_thin(&self, candles: &[Candle]) -> bool {
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        match (calculate_sma(&volumes, self.filter_lookback), volumes.last()) {
            (Some(mean), Some(&last)) if mean > 0.0 => last < mean * self.min_volume_ratio,
            _ => false,
        }
    }

    /// True when the last volatility reading spikes above its recent mean
    fn volatility_spiking(&self, candles: &[Candle]) -> bool {
        let series: Vec<f64> = calculate_atr_series(candles, self.volatility_period)
            .into_iter()
            .flatten()
            .collect();
        match (calculate_sma(&series, self.filter_lookback), series.last()) {
            (Some(mean), Some(&last)) if mean > 0.0 => last > mean * self.max_volatility_ratio,
            _ => false,
        }
    }
}

impl Default for TrendStrategy {
    fn default() -> Self {
        Self::new(&SignalConfig::default())
    }
}

impl Strategy for TrendStrategy {
    fn entry_signal(&self, candles: &[Candle]) -> Signal {
        let signal = self.engine.entry_signal(candles);
        if signal == Signal::Hold || !self.use_entry_filters {
            return signal;
        }

        if self.volume_too_thin(candles) {
            tracing::debug!("Entry suppressed: volume below {:.0}% of mean", self.min_volume_ratio * 100.0);
            return Signal::Hold;
        }
        if self.volatility_spiking(candles) {
            tracing::debug!("Entry suppressed: volatility above {:.1}x mean", self.max_volatility_ratio);
            return Signal::Hold;
        }
        signal
    }

    fn exit_signal(&self, candles: &[Candle], side: Side) -> bool {
        self.engine.exit_signal(candles, side)
    }

    fn volatility(&self, candles: &[Candle]) -> Option<f64> {
        self.engine.volatility(candles)
    }

    fn name(&self) -> &str {
        "TrendStrategy"
    }

    fn min_candles_required(&self) -> usize {
        self.engine.warmup_bars()
    }
}
