use chrono::{DateTime, Utc};

use super::validator::{CandleValidator, WindowViolation};
use crate::error::EngineError;
use crate::models::Candle;
use crate::timing::minute_floor;

/// Result of merging a fresh batch into the window
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// A newly completed bar was appended
    Appended { open_time: DateTime<Utc> },
    /// Nothing newer than the current last bar
    Unchanged,
}

/// Rolling window of completed one-minute candles for one symbol
///
/// Only ever mutated by append-and-trim; every candidate state is validated
/// before it replaces the previous one.
#[derive(Debug, Clone)]
pub struct CandleWindow {
    symbol: String,
    capacity: usize,
    candles: Vec<Candle>,
    validator: CandleValidator,
}

impl CandleWindow {
    /// Create an empty window
    ///
    /// # Arguments
    /// * `capacity` - Number of completed bars to retain
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            capacity,
            candles: Vec::with_capacity(capacity + 1),
            validator: CandleValidator::new(),
        }
    }

    /// Bulk load from the venue's most recent bars
    ///
    /// The final bar is still forming and is discarded. Exactly `capacity`
    /// completed bars must remain, otherwise nothing is committed.
    pub fn initialize(&mut self, bars: &[Candle]) -> Result<(), EngineError> {
        let completed = match bars.split_last() {
            Some((_forming, completed)) => completed,
            None => &[],
        };

        if completed.len() < self.capacity {
            return Err(self.integrity_failure(WindowViolation::InsufficientBars {
                len: completed.len(),
                required: self.capacity,
            }));
        }

        let candidate = completed[completed.len() - self.capacity..].to_vec();
        self.commit(candidate)?;

        tracing::debug!(
            symbol = %self.symbol,
            bars = self.candles.len(),
            "Window initialized"
        );
        Ok(())
    }

    /// Merge the latest completed bar from `fresh`
    ///
    /// Bars at or after the current server minute are still forming and are
    /// ignored. Duplicate or stale batches leave the window untouched.
    pub fn update(
        &mut self,
        fresh: &[Candle],
        server_now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, EngineError> {
        let current_minute = minute_floor(server_now);

        let latest_completed = fresh
            .iter()
            .filter(|c| c.open_time < current_minute)
            .max_by_key(|c| c.open_time);

        let Some(bar) = latest_completed else {
            return Ok(UpdateOutcome::Unchanged);
        };

        if let Some(last) = self.candles.last() {
            if bar.open_time <= last.open_time {
                return Ok(UpdateOutcome::Unchanged);
            }
        }

        let mut candidate = Vec::with_capacity(self.capacity + 1);
        candidate.extend_from_slice(&self.candles);
        candidate.push(bar.clone());
        if candidate.len() > self.capacity {
            let excess = candidate.len() - self.capacity;
            candidate.drain(..excess);
        }

        self.commit(candidate)?;
        Ok(UpdateOutcome::Appended {
            open_time: bar.open_time,
        })
    }

    /// True when the current contents satisfy every window invariant
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Detailed validation of the current contents
    pub fn check(&self) -> Result<(), WindowViolation> {
        self.validator.validate_window(&self.candles, self.capacity)
    }

    fn commit(&mut self, candidate: Vec<Candle>) -> Result<(), EngineError> {
        self.validator
            .validate_window(&candidate, self.capacity)
            .map_err(|violation| self.integrity_failure(violation))?;
        self.candles = candidate;
        Ok(())
    }

    fn integrity_failure(&self, violation: WindowViolation) -> EngineError {
        EngineError::DataIntegrityFailure {
            symbol: self.symbol.clone(),
            reason: violation.to_string(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.candles.len() == self.capacity
    }
}
