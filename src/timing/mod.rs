// Server clock synchronization and minute alignment
pub mod clock_sync;

pub use clock_sync::{aggregate_offsets, fold_offset, ClockSync, OffsetSample, ServerClock};

use chrono::{DateTime, Timelike, Utc};

/// Start of the minute containing `t`
pub fn minute_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_minute_floor() {
        let t = Utc.with_ymd_and_hms(2024, 10, 30, 14, 7, 42).unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(
            minute_floor(t),
            Utc.with_ymd_and_hms(2024, 10, 30, 14, 7, 0).unwrap()
        );
    }
}
