use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
///
/// Layered as defaults, then an optional TOML file, then `TRENDBOT__*`
/// environment variables (e.g. `TRENDBOT__UNITS__MAX_UNITS=10`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub window: WindowConfig,
    pub signal: SignalConfig,
    pub units: UnitLimits,
    pub pyramid: PyramidConfig,
    pub clock: ClockConfig,
    pub retry: RetryConfig,
    pub sizing: SizingConfig,
    pub paper: PaperConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["NAS100".to_string(), "EURUSD".to_string()],
            window: WindowConfig::default(),
            signal: SignalConfig::default(),
            units: UnitLimits::default(),
            pyramid: PyramidConfig::default(),
            clock: ClockConfig::default(),
            retry: RetryConfig::default(),
            sizing: SizingConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("trendbot").required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TRENDBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration sources")?;

        let config: EngineConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break window or cap invariants
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("no symbols configured");
        }
        if self.window.capacity < self.signal.warmup_bars {
            anyhow::bail!(
                "window capacity {} is smaller than signal warm-up {}",
                self.window.capacity,
                self.signal.warmup_bars
            );
        }
        if self.window.initial_bars <= self.window.capacity {
            anyhow::bail!(
                "initial bulk load ({}) must exceed window capacity ({}) to drop the forming bar",
                self.window.initial_bars,
                self.window.capacity
            );
        }
        if self.units.max_units_per_symbol > self.units.max_units {
            anyhow::bail!("per-symbol unit cap exceeds total unit cap");
        }
        if self.retry.attempts == 0 {
            anyhow::bail!("retry attempts must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub capacity: usize,
    /// Bars requested for the bulk load (capacity + the forming bar)
    pub initial_bars: usize,
    /// Bars requested on each cycle
    pub update_bars: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            initial_bars: 61,
            update_bars: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub short_ma: usize,
    pub mid_ma: usize,
    pub long_ma: usize,
    pub volatility_period: usize,
    pub warmup_bars: usize,
    pub use_entry_filters: bool,
    /// Skip entries when volume is below this share of its recent mean
    pub min_volume_ratio: f64,
    /// Skip entries when volatility is above this multiple of its recent mean
    pub max_volatility_ratio: f64,
    pub filter_lookback: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            short_ma: 5,
            mid_ma: 20,
            long_ma: 40,
            volatility_period: 20,
            warmup_bars: 40,
            use_entry_filters: false,
            min_volume_ratio: 0.5,
            max_volatility_ratio: 2.0,
            filter_lookback: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitLimits {
    pub max_units: usize,
    pub max_units_per_symbol: usize,
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            max_units: 15,
            max_units_per_symbol: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub max_orders: usize,
    /// Trigger spacing in multiples of entry volatility
    pub spacing: f64,
    /// Protective stop distance in multiples of entry volatility
    pub stop_multiple: f64,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            max_orders: 4,
            spacing: 0.5,
            stop_multiple: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub samples: usize,
    pub sample_interval_ms: u64,
    pub max_latency_secs: f64,
    pub health_attempts: u32,
    pub health_backoff_ms: u64,
    pub max_drift_secs: f64,
    /// Pause before re-reading server time after a failed read
    pub unavailable_pause_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            samples: 10,
            sample_interval_ms: 100,
            max_latency_secs: 1.0,
            health_attempts: 3,
            health_backoff_ms: 1000,
            max_drift_secs: 1.0,
            unavailable_pause_ms: 100,
        }
    }
}

impl ClockConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn health_backoff(&self) -> Duration {
        Duration::from_millis(self.health_backoff_ms)
    }

    pub fn unavailable_pause(&self) -> Duration {
        Duration::from_millis(self.unavailable_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Share of equity risked per unit of volatility
    pub risk_pct: f64,
    /// Initial protective stop in multiples of volatility
    pub stop_multiple: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_pct: 0.01,
            stop_multiple: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    pub start_price: f64,
    pub equity: f64,
    /// Simulated server clock skew relative to local time
    pub clock_offset_secs: i64,
    /// Per-bar return standard deviation of the random walk
    pub bar_volatility: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            start_price: 15000.0,
            equity: 10_000.0,
            clock_offset_secs: 0,
            bar_volatility: 0.0008,
        }
    }
}
