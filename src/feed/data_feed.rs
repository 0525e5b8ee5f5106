use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use super::candle_window::{CandleWindow, UpdateOutcome};
use crate::broker::Broker;
use crate::config::WindowConfig;
use crate::error::EngineError;
use crate::execution::retry::RetryPolicy;

/// What happened to a symbol's window this cycle
#[derive(Debug, Clone, PartialEq)]
pub enum FeedStatus {
    Appended { open_time: DateTime<Utc> },
    Unchanged,
    /// Window was rebuilt from a bulk load
    Reloaded,
}

/// Keeps one rolling candle window per traded symbol in step with the venue
pub struct DataFeed {
    symbols: Vec<String>,
    windows: HashMap<String, CandleWindow>,
    needs_reload: HashSet<String>,
    config: WindowConfig,
    retry: RetryPolicy,
}

impl DataFeed {
    pub fn new(symbols: &[String], config: &WindowConfig, retry: RetryPolicy) -> Self {
        let windows = symbols
            .iter()
            .map(|s| (s.clone(), CandleWindow::new(s.clone(), config.capacity)))
            .collect();

        Self {
            symbols: symbols.to_vec(),
            windows,
            needs_reload: symbols.iter().cloned().collect(),
            config: config.clone(),
            retry,
        }
    }

    /// Bulk load every symbol, returning the per-symbol outcome
    pub fn initialize_all(&mut self, broker: &dyn Broker) -> Vec<(String, Result<(), EngineError>)> {
        self.symbols
            .clone()
            .into_iter()
            .map(|symbol| {
                let result = self.reload(broker, &symbol);
                (symbol, result)
            })
            .collect()
    }

    /// Merge the newest completed bar for every symbol
    pub fn update_all(
        &mut self,
        broker: &dyn Broker,
        server_now: DateTime<Utc>,
    ) -> Vec<(String, Result<FeedStatus, EngineError>)> {
        self.symbols
            .clone()
            .into_iter()
            .map(|symbol| {
                let result = self.update_symbol(broker, &symbol, server_now);
                (symbol, result)
            })
            .collect()
    }

    /// Refresh one symbol
    ///
    /// A window that previously failed validation is rebuilt from a bulk load
    /// instead of appended to. A failed append keeps the previous window and
    /// schedules a rebuild for the next cycle.
    pub fn update_symbol(
        &mut self,
        broker: &dyn Broker,
        symbol: &str,
        server_now: DateTime<Utc>,
    ) -> Result<FeedStatus, EngineError> {
        if self.needs_reload.contains(symbol) {
            self.reload(broker, symbol)?;
            return Ok(FeedStatus::Reloaded);
        }

        let count = self.config.update_bars;
        let fresh = self
            .retry
            .run("recent_bars", || broker.recent_bars(symbol, count))?;

        let window = self.window_mut(symbol)?;
        match window.update(&fresh, server_now) {
            Ok(UpdateOutcome::Appended { open_time }) => {
                tracing::debug!(symbol, %open_time, "Appended completed bar");
                Ok(FeedStatus::Appended { open_time })
            }
            Ok(UpdateOutcome::Unchanged) => Ok(FeedStatus::Unchanged),
            Err(err) => {
                tracing::warn!("⚠️  {} window update rejected: {}, reloading next cycle", symbol, err);
                self.needs_reload.insert(symbol.to_string());
                Err(err)
            }
        }
    }

    fn reload(&mut self, broker: &dyn Broker, symbol: &str) -> Result<(), EngineError> {
        let count = self.config.initial_bars;
        let bars = self
            .retry
            .run("recent_bars", || broker.recent_bars(symbol, count))?;

        self.window_mut(symbol)?.initialize(&bars)?;
        self.needs_reload.remove(symbol);
        tracing::info!(symbol, bars = count - 1, "📊 Window loaded");
        Ok(())
    }

    fn window_mut(&mut self, symbol: &str) -> Result<&mut CandleWindow, EngineError> {
        self.windows
            .get_mut(symbol)
            .ok_or_else(|| EngineError::DataIntegrityFailure {
                symbol: symbol.to_string(),
                reason: "symbol is not tracked".to_string(),
            })
    }

    pub fn window(&self, symbol: &str) -> Option<&CandleWindow> {
        self.windows.get(symbol)
    }

    /// True when the symbol's window is committed and not awaiting a rebuild
    pub fn is_ready(&self, symbol: &str) -> bool {
        !self.needs_reload.contains(symbol)
            && self.windows.get(symbol).is_some_and(CandleWindow::validate)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}
