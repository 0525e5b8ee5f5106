use chrono::{DateTime, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ClockConfig;
use crate::error::{BrokerError, EngineError};

/// Anything that can report the broker server's wall clock
pub trait ServerClock {
    fn server_time(&self) -> Result<DateTime<Utc>, BrokerError>;
}

/// One round-trip measurement against the server clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSample {
    /// server - (local send time + one-way latency), seconds
    pub offset: f64,
    /// Half the measured round trip, seconds
    pub one_way_latency: f64,
}

impl OffsetSample {
    pub fn measure(server_time: DateTime<Utc>, local_send: DateTime<Utc>, round_trip: f64) -> Self {
        let one_way_latency = round_trip / 2.0;
        let raw = micros_between(local_send, server_time) - one_way_latency;
        Self {
            offset: raw,
            one_way_latency,
        }
    }
}

/// Fold an offset into (-30, 30]
///
/// Only the sub-minute remainder is meaningful for bar alignment, so a skew of
/// 45s is read as -15s.
pub fn fold_offset(raw: f64) -> f64 {
    let remainder = raw.rem_euclid(60.0);
    if remainder > 30.0 {
        remainder - 60.0
    } else {
        remainder
    }
}

/// Robust offset from a batch of samples
///
/// Drops samples slower than `max_latency`, folds the rest, trims the lowest
/// and highest when at least four remain, then takes the median.
pub fn aggregate_offsets(samples: &[OffsetSample], max_latency: f64) -> Option<f64> {
    let mut offsets: Vec<f64> = samples
        .iter()
        .filter(|s| s.one_way_latency <= max_latency)
        .map(|s| fold_offset(s.offset))
        .collect();

    if offsets.is_empty() {
        return None;
    }

    offsets.sort_by(f64::total_cmp);
    let trimmed = if offsets.len() >= 4 {
        &offsets[1..offsets.len() - 1]
    } else {
        &offsets[..]
    };

    Some(median(trimmed))
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn micros_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

/// Tracks the server/local clock skew and gates the minute cycle
pub struct ClockSync {
    config: ClockConfig,
    offset: f64,
}

impl ClockSync {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            offset: 0.0,
        }
    }

    /// Estimated (server - local) skew in seconds
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Re-estimate and store the offset
    pub fn synchronize(&mut self, source: &dyn ServerClock) -> f64 {
        self.offset = self.calculate_offset(source);
        tracing::info!("⏱ Server clock offset: {:+.3}s", self.offset);
        self.offset
    }

    /// Sample the server clock and return a robust offset estimate
    ///
    /// Returns 0.0 when no usable sample was collected.
    pub fn calculate_offset(&self, source: &dyn ServerClock) -> f64 {
        let mut samples = Vec::with_capacity(self.config.samples);

        for i in 0..self.config.samples {
            let local_send = Utc::now();
            let started = Instant::now();
            let server_time = source.server_time();
            let round_trip = started.elapsed().as_secs_f64();

            match server_time {
                Ok(server_time) => {
                    samples.push(OffsetSample::measure(server_time, local_send, round_trip));
                }
                Err(e) => {
                    tracing::debug!("Clock sample {} failed: {}", i + 1, e);
                }
            }

            if i + 1 < self.config.samples && self.config.sample_interval_ms > 0 {
                thread::sleep(self.config.sample_interval());
            }
        }

        match aggregate_offsets(&samples, self.config.max_latency_secs) {
            Some(offset) => offset,
            None => {
                tracing::warn!(
                    "No usable clock samples out of {} attempts, assuming zero offset",
                    self.config.samples
                );
                0.0
            }
        }
    }

    /// Block until the server clock reads second 0 of a new minute
    ///
    /// Sleeps at most one second at a time so a slow clock source cannot make
    /// us overshoot the boundary. Returns false if `stop` was raised first.
    pub fn wait_for_boundary(&self, source: &dyn ServerClock, stop: &AtomicBool) -> bool {
        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }

            let server_time = match source.server_time() {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!("Server time unavailable while waiting: {}", e);
                    thread::sleep(self.config.unavailable_pause());
                    continue;
                }
            };

            if server_time.second() == 0 {
                return true;
            }

            let seconds = server_time.second() as f64 + server_time.nanosecond() as f64 / 1e9;
            let wait = (60.0 - seconds).clamp(0.0, 1.0);
            thread::sleep(Duration::from_secs_f64(wait));
        }
    }

    /// Verify the server clock is reachable and still agrees with our offset
    ///
    /// Each failed attempt re-estimates the offset before backing off.
    pub fn check_health(&mut self, source: &dyn ServerClock) -> Result<(), EngineError> {
        let mut last_reason = String::from("no attempts made");

        for attempt in 1..=self.config.health_attempts {
            match source.server_time() {
                Ok(server_time) => {
                    let drift = self.drift(server_time, Utc::now());
                    if drift.abs() < self.config.max_drift_secs {
                        return Ok(());
                    }
                    last_reason = format!("clock drift {:+.3}s", drift);
                    tracing::warn!(
                        "Clock health attempt {}/{}: {}, resynchronizing",
                        attempt,
                        self.config.health_attempts,
                        last_reason
                    );
                    self.synchronize(source);
                }
                Err(e) => {
                    last_reason = e.to_string();
                    tracing::warn!(
                        "Clock health attempt {}/{}: {}",
                        attempt,
                        self.config.health_attempts,
                        last_reason
                    );
                }
            }

            if attempt < self.config.health_attempts {
                thread::sleep(self.config.health_backoff());
            }
        }

        Err(EngineError::ConnectivityFailure {
            operation: "clock health check".to_string(),
            reason: last_reason,
        })
    }

    /// Offset-corrected disagreement between a server reading and local time
    fn drift(&self, server_time: DateTime<Utc>, local: DateTime<Utc>) -> f64 {
        fold_offset(micros_between(local, server_time) - self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    fn test_config() -> ClockConfig {
        ClockConfig {
            samples: 10,
            sample_interval_ms: 0,
            max_latency_secs: 1.0,
            health_attempts: 3,
            health_backoff_ms: 1,
            max_drift_secs: 1.0,
            unavailable_pause_ms: 1,
        }
    }

    /// Server clock running a fixed skew ahead of local time
    struct SkewedClock {
        skew: ChronoDuration,
    }

    impl ServerClock for SkewedClock {
        fn server_time(&self) -> Result<DateTime<Utc>, BrokerError> {
            Ok(Utc::now() + self.skew)
        }
    }

    struct DeadClock {
        calls: Cell<u32>,
    }

    impl ServerClock for DeadClock {
        fn server_time(&self) -> Result<DateTime<Utc>, BrokerError> {
            self.calls.set(self.calls.get() + 1);
            Err(BrokerError::Unavailable("terminal offline".into()))
        }
    }

    /// Replays scripted readings, one per call
    struct ScriptedClock {
        readings: RefCell<VecDeque<Result<DateTime<Utc>, BrokerError>>>,
    }

    impl ServerClock for ScriptedClock {
        fn server_time(&self) -> Result<DateTime<Utc>, BrokerError> {
            self.readings
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(BrokerError::Unavailable("script exhausted".into())))
        }
    }

    fn sample(offset: f64) -> OffsetSample {
        OffsetSample {
            offset,
            one_way_latency: 0.01,
        }
    }

    #[test]
    fn test_fold_offset() {
        assert_eq!(fold_offset(5.0), 5.0);
        assert_eq!(fold_offset(30.0), 30.0);
        assert_eq!(fold_offset(45.0), -15.0);
        assert_eq!(fold_offset(-10.0), -10.0);
        assert_eq!(fold_offset(125.0), 5.0);
        assert_eq!(fold_offset(-30.0), 30.0); // (-30, 30] is half-open
    }

    #[test]
    fn test_aggregate_trims_outliers() {
        let samples = vec![sample(2.0), sample(2.1), sample(25.0), sample(1.9), sample(-20.0)];
        // Sorted: -20, 1.9, 2.0, 2.1, 25 -> trimmed 1.9, 2.0, 2.1 -> 2.0
        assert_eq!(aggregate_offsets(&samples, 1.0), Some(2.0));
    }

    #[test]
    fn test_aggregate_small_batch_not_trimmed() {
        let samples = vec![sample(1.0), sample(3.0)];
        assert_eq!(aggregate_offsets(&samples, 1.0), Some(2.0));
    }

    #[test]
    fn test_aggregate_drops_slow_samples() {
        let slow = OffsetSample {
            offset: 40.0,
            one_way_latency: 1.5,
        };
        let samples = vec![slow, sample(3.0)];
        assert_eq!(aggregate_offsets(&samples, 1.0), Some(3.0));
        assert_eq!(aggregate_offsets(&[slow], 1.0), None);
    }

    #[test]
    fn test_aggregate_folds_before_median() {
        // 59s and 1s are both about one second away from the boundary
        let samples = vec![sample(59.0), sample(1.0), sample(0.5)];
        assert_eq!(aggregate_offsets(&samples, 1.0), Some(0.5));
    }

    #[test]
    fn test_sample_measurement() {
        let local = Utc.with_ymd_and_hms(2024, 10, 30, 14, 0, 0).unwrap();
        let server = local + ChronoDuration::milliseconds(2_500);

        let s = OffsetSample::measure(server, local, 1.0);
        assert_eq!(s.one_way_latency, 0.5);
        assert!((s.offset - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_offset_tracks_skew() {
        let clock = SkewedClock {
            skew: ChronoDuration::seconds(7),
        };
        let sync = ClockSync::new(test_config());

        let offset = sync.calculate_offset(&clock);
        assert!((offset - 7.0).abs() < 0.1, "offset was {offset}");
    }

    #[test]
    fn test_calculate_offset_wraps_large_skew() {
        let clock = SkewedClock {
            skew: ChronoDuration::seconds(50),
        };
        let sync = ClockSync::new(test_config());

        let offset = sync.calculate_offset(&clock);
        assert!((offset + 10.0).abs() < 0.1, "offset was {offset}");
    }

    #[test]
    fn test_calculate_offset_without_samples_is_zero() {
        let clock = DeadClock { calls: Cell::new(0) };
        let sync = ClockSync::new(test_config());

        assert_eq!(sync.calculate_offset(&clock), 0.0);
        assert_eq!(clock.calls.get(), 10);
    }

    #[test]
    fn test_health_ok_after_sync() {
        let clock = SkewedClock {
            skew: ChronoDuration::seconds(3),
        };
        let mut sync = ClockSync::new(test_config());
        sync.synchronize(&clock);

        assert!(sync.check_health(&clock).is_ok());
    }

    #[test]
    fn test_health_resyncs_on_drift() {
        let clock = SkewedClock {
            skew: ChronoDuration::seconds(12),
        };
        // Offset still zero, first attempt sees 12s drift and resynchronizes
        let mut sync = ClockSync::new(test_config());

        assert!(sync.check_health(&clock).is_ok());
        assert!((sync.offset() - 12.0).abs() < 0.1);
    }

    #[test]
    fn test_health_fails_after_retry_budget() {
        let clock = DeadClock { calls: Cell::new(0) };
        let mut sync = ClockSync::new(test_config());

        let result = sync.check_health(&clock);
        assert!(matches!(
            result,
            Err(EngineError::ConnectivityFailure { .. })
        ));
        assert_eq!(clock.calls.get(), 3);
    }

    #[test]
    fn test_wait_for_boundary_returns_on_second_zero() {
        let base = Utc.with_ymd_and_hms(2024, 10, 30, 14, 0, 59).unwrap();
        let clock = ScriptedClock {
            readings: RefCell::new(VecDeque::from(vec![
                Err(BrokerError::Unavailable("blip".into())),
                Ok(base + ChronoDuration::milliseconds(980)),
                Ok(base + ChronoDuration::seconds(1)),
            ])),
        };
        let sync = ClockSync::new(test_config());
        let stop = AtomicBool::new(false);

        assert!(sync.wait_for_boundary(&clock, &stop));
        assert!(clock.readings.borrow().is_empty());
    }

    #[test]
    fn test_wait_for_boundary_honours_stop() {
        let clock = SkewedClock {
            skew: ChronoDuration::zero(),
        };
        let sync = ClockSync::new(test_config());
        let stop = AtomicBool::new(true);

        assert!(!sync.wait_for_boundary(&clock, &stop));
    }
}
