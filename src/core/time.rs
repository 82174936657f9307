//! Timestamps counted in a process-wide base unit.
//!
//! A `TimeUnit` is the number of base units elapsed since the Unix epoch.
//! The base unit is the engine's minimum timeframe (1 second in production,
//! 1 millisecond for high-resolution deployments); `TimeScale` carries the
//! conversion between `TimeUnit` values and wall-clock time.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{EngineError, EngineResult};
use super::timeframe::Timeframe;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TimeUnit(i64);

impl TimeUnit {
    pub const ZERO: TimeUnit = TimeUnit(0);
    pub const MAX: TimeUnit = TimeUnit(i64::MAX);

    pub fn new(v: i64) -> Self {
        TimeUnit(v)
    }

    pub fn int(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Big-endian form used inside data keys. Big-endian is mandatory so
    /// lexicographic key order equals timestamp order.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(b: [u8; 8]) -> Self {
        TimeUnit(i64::from_be_bytes(b))
    }

    /// Decimal-ASCII form used for consistency watermark values.
    pub fn to_decimal_string(self) -> String {
        self.0.to_string()
    }

    pub fn from_decimal_bytes(b: &[u8]) -> EngineResult<Self> {
        let s = std::str::from_utf8(b)
            .map_err(|e| EngineError::Malformed(format!("consistency value: {}", e)))?;
        let v = s
            .parse::<i64>()
            .map_err(|e| EngineError::Malformed(format!("consistency value '{}': {}", s, e)))?;
        Ok(TimeUnit(v))
    }
}

impl std::ops::Add<i64> for TimeUnit {
    type Output = TimeUnit;
    fn add(self, rhs: i64) -> TimeUnit {
        TimeUnit(self.0 + rhs)
    }
}

impl std::ops::Sub<i64> for TimeUnit {
    type Output = TimeUnit;
    fn sub(self, rhs: i64) -> TimeUnit {
        TimeUnit(self.0 - rhs)
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversion between `TimeUnit` counts and wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeScale {
    unit_millis: i64,
}

impl TimeScale {
    pub fn new(unit: Duration) -> EngineResult<Self> {
        let millis = unit.as_millis() as i64;
        if millis < 1 {
            return Err(EngineError::Config(
                "base time unit must be at least 1ms".to_string(),
            ));
        }
        Ok(TimeScale { unit_millis: millis })
    }

    pub fn unit_millis(&self) -> i64 {
        self.unit_millis
    }

    /// Whether the base unit is a whole number of seconds; governs the CSV
    /// timestamp rendering (unix seconds vs raw unit count).
    pub fn is_second_aligned(&self) -> bool {
        self.unit_millis >= 1_000 && self.unit_millis % 1_000 == 0
    }

    pub fn now(&self) -> TimeUnit {
        TimeUnit(Utc::now().timestamp_millis() / self.unit_millis)
    }

    /// Number of base units in one step of `tf`. At least 1.
    pub fn steps(&self, tf: Timeframe) -> i64 {
        (tf.millis() / self.unit_millis).max(1)
    }

    pub fn add(&self, t: TimeUnit, tf: Timeframe) -> TimeUnit {
        t + self.steps(tf)
    }

    pub fn to_datetime(&self, t: TimeUnit) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(t.int() * self.unit_millis)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
    }

    pub fn from_datetime(&self, dt: DateTime<Utc>) -> TimeUnit {
        TimeUnit(dt.timestamp_millis() / self.unit_millis)
    }

    pub fn unix_seconds(&self, t: TimeUnit) -> i64 {
        t.int() * self.unit_millis / 1_000
    }

    pub fn date_str(&self, t: TimeUnit) -> String {
        self.to_datetime(t).format(DATE_FORMAT).to_string()
    }

    /// Midnight UTC of the given `YYYY-MM-DD` date.
    pub fn parse_date(&self, date: &str) -> EngineResult<TimeUnit> {
        let d = NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|e| EngineError::Validation(format!("invalid date '{}': {}", date, e)))?;
        let dt = d
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| EngineError::Validation(format!("invalid date '{}'", date)))?;
        Ok(self.from_datetime(Utc.from_utc_datetime(&dt)))
    }

    pub fn day_start(&self, t: TimeUnit) -> TimeUnit {
        let day_units = self.day_units();
        TimeUnit(t.int() - t.int().rem_euclid(day_units))
    }

    pub fn next_day(&self, t: TimeUnit) -> TimeUnit {
        self.day_start(t) + self.day_units()
    }

    pub fn day_units(&self) -> i64 {
        86_400_000 / self.unit_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seconds_scale() -> TimeScale {
        TimeScale::new(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn date_round_trip() {
        let scale = seconds_scale();
        let t = scale.parse_date("2023-11-14").unwrap();
        assert_eq!(scale.date_str(t), "2023-11-14");
        assert_eq!(t.int(), 1_699_920_000);
    }

    #[test]
    fn day_boundaries() {
        let scale = seconds_scale();
        let t = scale.parse_date("2023-11-14").unwrap() + 3_600;
        assert_eq!(scale.date_str(scale.day_start(t)), "2023-11-14");
        assert_eq!(scale.date_str(scale.next_day(t)), "2023-11-15");
    }

    #[test]
    fn big_endian_preserves_order() {
        let a = TimeUnit::new(1_700_000_000).to_be_bytes();
        let b = TimeUnit::new(1_700_000_001).to_be_bytes();
        assert!(a < b);
    }

    #[test]
    fn millisecond_scale_is_not_second_aligned() {
        let scale = TimeScale::new(Duration::from_millis(1)).unwrap();
        assert!(!scale.is_second_aligned());
        assert!(seconds_scale().is_second_aligned());
    }
}
