//! Small helpers for mixing `std::time::Duration` with chrono timestamps.
//!
//! Timestamps are persisted with millisecond precision, so everything that
//! crosses a storage boundary goes through `to_millis`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `t + d`, saturating at the maximum representable timestamp.
pub fn add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `t - d`, saturating at the minimum representable timestamp.
pub fn sub(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn add_and_sub_saturate() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(add(t, Duration::from_secs(90)), t + TimeDelta::seconds(90));
        assert_eq!(add(t, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(sub(t, Duration::from_secs(90)), t - TimeDelta::seconds(90));
        assert_eq!(sub(t, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn millis_truncate_sub_millisecond_precision() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + TimeDelta::microseconds(1500);
        assert_eq!(to_millis(t), to_millis(t - TimeDelta::microseconds(500)));
    }
}
