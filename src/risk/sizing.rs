use crate::config::SizingConfig;
use crate::models::{Side, SymbolSpec};

/// Volatility-based unit sizing and initial stop placement
#[derive(Debug, Clone)]
pub struct UnitSizer {
    risk_pct: f64,
    stop_multiple: f64,
}

impl UnitSizer {
    pub fn new(config: &SizingConfig) -> Self {
        Self {
            risk_pct: config.risk_pct,
            stop_multiple: config.stop_multiple,
        }
    }

    /// Volume whose one-volatility move costs `risk_pct` of equity
    ///
    /// Rounded to the volume step and clamped to the symbol's volume range.
    /// Falls back to the minimum volume when volatility is not positive.
    pub fn unit_size(&self, equity: f64, volatility: f64, spec: &SymbolSpec) -> f64 {
        let dollar_volatility = if spec.tick_size > 0.0 {
            volatility / spec.tick_size * spec.tick_value
        } else {
            0.0
        };
        if dollar_volatility <= 0.0 || !dollar_volatility.is_finite() {
            tracing::warn!("⚠️  Non-positive dollar volatility, using minimum volume");
            return spec.volume_min;
        }

        let raw = equity * self.risk_pct / dollar_volatility;
        let stepped = if spec.volume_step > 0.0 {
            (raw / spec.volume_step).round() * spec.volume_step
        } else {
            raw
        };
        // Strip float noise from the step multiplication
        let stepped = (stepped * 1e8).round() / 1e8;

        if spec.volume_min <= spec.volume_max {
            stepped.clamp(spec.volume_min, spec.volume_max)
        } else {
            tracing::warn!(
                "⚠️  Volume range [{}, {}] is inverted or undefined, using minimum volume",
                spec.volume_min,
                spec.volume_max
            );
            spec.volume_min
        }
    }

    /// Protective stop for a fresh entry
    pub fn entry_stop(&self, side: Side, entry_price: f64, volatility: f64) -> f64 {
        entry_price - side.sign() * self.stop_multiple * volatility
    }
}

impl Default for UnitSizer {
    fn default() -> Self {
        Self::new(&SizingConfig::default())
    }
}
