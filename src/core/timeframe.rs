//! Timeframe labels and calendar-aware bucket alignment.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use std::time::Duration;

use super::error::{EngineError, EngineResult};
use super::time::{TimeScale, TimeUnit};

const MILLIS_SECOND: i64 = 1_000;
const MILLIS_MINUTE: i64 = 60 * MILLIS_SECOND;
const MILLIS_HOUR: i64 = 60 * MILLIS_MINUTE;
const MILLIS_DAY: i64 = 24 * MILLIS_HOUR;
const MILLIS_WEEK: i64 = 7 * MILLIS_DAY;
const MILLIS_MONTH: i64 = 30 * MILLIS_DAY;
const MILLIS_QUARTER: i64 = 90 * MILLIS_DAY;

/// A fixed-duration timeframe. Week, month and quarter use nominal lengths
/// (7/30/90 days); their bucket boundaries are calendar-aligned in
/// [`initial_bucket_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeframe {
    millis: i64,
}

impl Timeframe {
    pub const SECOND: Timeframe = Timeframe { millis: MILLIS_SECOND };
    pub const MINUTE: Timeframe = Timeframe { millis: MILLIS_MINUTE };
    pub const HOUR: Timeframe = Timeframe { millis: MILLIS_HOUR };
    pub const DAY: Timeframe = Timeframe { millis: MILLIS_DAY };
    pub const WEEK: Timeframe = Timeframe { millis: MILLIS_WEEK };
    pub const MONTH: Timeframe = Timeframe { millis: MILLIS_MONTH };
    pub const QUARTER: Timeframe = Timeframe { millis: MILLIS_QUARTER };

    pub fn from_millis(millis: i64) -> EngineResult<Self> {
        if millis < 1 {
            return Err(EngineError::Validation(format!(
                "timeframe must be positive, got {}ms",
                millis
            )));
        }
        Ok(Timeframe { millis })
    }

    pub fn from_duration(d: Duration) -> EngineResult<Self> {
        Self::from_millis(d.as_millis() as i64)
    }

    pub fn millis(self) -> i64 {
        self.millis
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.millis as u64)
    }

    /// Human-readable label used inside data keys: `"1s"`, `"15min"`,
    /// `"4h"`, `"1d"`, `"1w"`, `"1m"`, `"1q"`.
    pub fn label(self) -> String {
        let m = self.millis;
        if m == MILLIS_QUARTER {
            return "1q".to_string();
        }
        if m % MILLIS_MONTH == 0 {
            return format!("{}m", m / MILLIS_MONTH);
        }
        if m % MILLIS_WEEK == 0 {
            return format!("{}w", m / MILLIS_WEEK);
        }
        if m % MILLIS_DAY == 0 {
            return format!("{}d", m / MILLIS_DAY);
        }
        if m % MILLIS_HOUR == 0 {
            return format!("{}h", m / MILLIS_HOUR);
        }
        if m % MILLIS_MINUTE == 0 {
            return format!("{}min", m / MILLIS_MINUTE);
        }
        if m % MILLIS_SECOND == 0 {
            return format!("{}s", m / MILLIS_SECOND);
        }
        format!("{}ms", m)
    }

    pub fn parse_label(label: &str) -> EngineResult<Self> {
        let split = label
            .find(|c: char| !c.is_ascii_digit())
            .filter(|&i| i > 0)
            .ok_or_else(|| {
                EngineError::Validation(format!("invalid timeframe label '{}'", label))
            })?;
        let (digits, unit) = label.split_at(split);
        let n: i64 = digits
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid timeframe label '{}'", label)))?;
        let unit_millis = match unit {
            "ms" => 1,
            "s" => MILLIS_SECOND,
            "min" => MILLIS_MINUTE,
            "h" => MILLIS_HOUR,
            "d" => MILLIS_DAY,
            "w" => MILLIS_WEEK,
            "m" => MILLIS_MONTH,
            "q" => MILLIS_QUARTER,
            _ => {
                return Err(EngineError::Validation(format!(
                    "unknown timeframe unit '{}'",
                    unit
                )))
            }
        };
        Timeframe::from_millis(n * unit_millis)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn midnight(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(y, m, d).expect("valid calendar date");
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"))
}

fn next_quarter(t: DateTime<Utc>) -> DateTime<Utc> {
    let quarter = (t.month0() / 3) as i32;
    let mut year = t.year();
    let mut month = quarter * 3 + 4;
    if month > 12 {
        month -= 12;
        year += 1;
    }
    midnight(year, month as u32, 1)
}

fn next_n_month(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let total = t.month0() as i64 + n;
    let year = t.year() + (total / 12) as i32;
    let month = (total % 12) as u32 + 1;
    midnight(year, month, 1)
}

fn next_n_week(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let mut offset = -(t.weekday().num_days_from_monday() as i64);
    if offset <= 0 {
        offset += 7;
    }
    let start = t.date_naive() + chrono::Days::new((offset + 7 * (n - 1)) as u64);
    midnight(start.year(), start.month(), start.day())
}

fn next_n_day(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let d = t.date_naive() + chrono::Days::new(n as u64);
    midnight(d.year(), d.month(), d.day())
}

fn is_midnight(t: DateTime<Utc>) -> bool {
    t.hour() == 0 && t.minute() == 0 && t.second() == 0
}

/// First bucket `[t0, t1)` for indexing a stream whose data starts at
/// `earliest`. `t1` is the first calendar-aligned bucket boundary after the
/// start: quarters open on quarter firsts, months on month firsts, weeks on
/// Mondays, days at midnight; multi-hour and multi-minute frames snap to the
/// next midnight unless the start already sits on one.
pub fn initial_bucket_range(
    scale: &TimeScale,
    earliest: TimeUnit,
    tf: Timeframe,
) -> (TimeUnit, TimeUnit) {
    let t = scale.to_datetime(earliest);
    let m = tf.millis();

    let t1 = if m == MILLIS_QUARTER {
        next_quarter(t)
    } else if m % MILLIS_MONTH == 0 {
        next_n_month(t, m / MILLIS_MONTH)
    } else if m % MILLIS_WEEK == 0 {
        next_n_week(t, m / MILLIS_WEEK)
    } else if m % MILLIS_DAY == 0 {
        next_n_day(t, m / MILLIS_DAY)
    } else if m % MILLIS_HOUR == 0 {
        if m == MILLIS_HOUR {
            midnight(t.year(), t.month(), t.day())
                + chrono::Duration::hours(t.hour() as i64 + 1)
        } else if is_midnight(t) {
            return (earliest, scale.add(earliest, tf));
        } else {
            let t0 = next_n_day(t, 1);
            let start = scale.from_datetime(t0);
            return (start, scale.add(start, tf));
        }
    } else if m % MILLIS_MINUTE == 0 {
        if m == MILLIS_MINUTE {
            midnight(t.year(), t.month(), t.day())
                + chrono::Duration::minutes(t.hour() as i64 * 60 + t.minute() as i64 + 1)
        } else if is_midnight(t) {
            return (earliest, scale.add(earliest, tf));
        } else {
            let t0 = next_n_day(t, 1);
            let start = scale.from_datetime(t0);
            return (start, scale.add(start, tf));
        }
    } else {
        return (earliest, scale.add(earliest, tf));
    };

    (earliest, scale.from_datetime(t1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scale() -> TimeScale {
        TimeScale::new(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn label_round_trip() {
        for label in ["1s", "15s", "1min", "15min", "1h", "4h", "1d", "3d", "1w", "1m", "1q"] {
            let tf = Timeframe::parse_label(label).unwrap();
            assert_eq!(tf.label(), label);
        }
    }

    #[test]
    fn rejects_garbage_labels() {
        assert!(Timeframe::parse_label("").is_err());
        assert!(Timeframe::parse_label("min").is_err());
        assert!(Timeframe::parse_label("5x").is_err());
        assert!(Timeframe::parse_label("0s").is_err());
    }

    #[test]
    fn day_bucket_snaps_to_next_midnight() {
        let scale = scale();
        // 2023-11-14 08:00:00 UTC
        let start = scale.parse_date("2023-11-14").unwrap() + 8 * 3600;
        let (t0, t1) = initial_bucket_range(&scale, start, Timeframe::DAY);
        assert_eq!(t0, start);
        assert_eq!(scale.date_str(t1), "2023-11-15");
        assert_eq!(t1.int() % scale.day_units(), 0);
    }

    #[test]
    fn week_bucket_opens_on_monday() {
        let scale = scale();
        // 2023-11-14 is a Tuesday; the next Monday is 2023-11-20.
        let start = scale.parse_date("2023-11-14").unwrap();
        let (_, t1) = initial_bucket_range(&scale, start, Timeframe::WEEK);
        assert_eq!(scale.date_str(t1), "2023-11-20");
    }

    #[test]
    fn quarter_bucket_opens_on_quarter_first() {
        let scale = scale();
        let start = scale.parse_date("2023-11-14").unwrap();
        let (_, t1) = initial_bucket_range(&scale, start, Timeframe::QUARTER);
        assert_eq!(scale.date_str(t1), "2024-01-01");
    }

    #[test]
    fn month_bucket_opens_on_month_first() {
        let scale = scale();
        let start = scale.parse_date("2023-12-14").unwrap();
        let (_, t1) = initial_bucket_range(&scale, start, Timeframe::MONTH);
        assert_eq!(scale.date_str(t1), "2024-01-01");
    }

    #[test]
    fn multi_hour_bucket_from_midnight_keeps_origin() {
        let scale = scale();
        let start = scale.parse_date("2023-11-14").unwrap();
        let tf = Timeframe::parse_label("4h").unwrap();
        let (t0, t1) = initial_bucket_range(&scale, start, tf);
        assert_eq!(t0, start);
        assert_eq!(t1, start + 4 * 3600);
    }

    #[test]
    fn one_second_bucket_advances_by_unit() {
        let scale = scale();
        let start = scale.parse_date("2023-11-14").unwrap() + 42;
        let (t0, t1) = initial_bucket_range(&scale, start, Timeframe::SECOND);
        assert_eq!(t0, start);
        assert_eq!(t1, start + 1);
    }
}
