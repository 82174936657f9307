//! Candle-style tick variant: OHLC plus average, median, absolute price
//! movement and contributing sample count.

use serde::{Deserialize, Serialize};

use super::numeric::{format_float, precision_of, round_to, safe_average, safe_median};
use super::{AbsoluteSumMode, CsvRequirement};
use crate::core::{EngineError, EngineResult, TimeScale, TimeUnit};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

pub const TIME: &str = "time";
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const AVERAGE: &str = "average";
pub const MEDIAN: &str = "median";
pub const ABSOLUTE_SUM: &str = "absolute_sum";
pub const COUNT: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Unit {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub average: f64,
    pub median: f64,
    pub absolute_sum: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitTick {
    pub time: TimeUnit,
    pub unit: Unit,
}

impl Unit {
    /// A single-sample candle. A zero value is the empty candle.
    pub fn from_value(v: f64) -> Unit {
        if v == 0.0 {
            return Unit::default();
        }
        Unit {
            open: v,
            high: v,
            low: v,
            close: v,
            average: v,
            median: v,
            absolute_sum: 0.0,
            count: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> f64 {
        self.low
    }

    pub fn max(&self) -> f64 {
        self.high
    }

    pub fn at(self, time: TimeUnit) -> UnitTick {
        UnitTick { time, unit: self }
    }

    /// Short form for single-sample candles, long `@`-joined form otherwise.
    pub fn to_raw(&self, decimals: i8) -> Vec<u8> {
        if self.count == 1 {
            return format_float(self.open, decimals).into_bytes();
        }
        format!(
            "{}@{}@{}@{}@{}@{}@{}@{}",
            format_float(self.open, -1),
            format_float(self.high, -1),
            format_float(self.low, -1),
            format_float(self.close, -1),
            format_float(self.average, -1),
            format_float(self.median, -1),
            format_float(self.absolute_sum, -1),
            self.count
        )
        .into_bytes()
    }

    pub fn parse_raw(raw: &[u8]) -> EngineResult<Unit> {
        let s = std::str::from_utf8(raw)
            .map_err(|_| EngineError::Malformed("unit tick is not utf-8".to_string()))?;
        let fields: Vec<&str> = s.split('@').collect();
        match fields.len() {
            1 => {
                let v: f64 = fields[0]
                    .parse()
                    .map_err(|_| EngineError::Malformed(format!("unit tick '{}'", s)))?;
                Ok(Unit::from_value(v))
            }
            8 => {
                let parse = |i: usize| -> EngineResult<f64> {
                    fields[i]
                        .parse()
                        .map_err(|_| EngineError::Malformed(format!("unit tick '{}'", s)))
                };
                Ok(Unit {
                    open: parse(0)?,
                    high: parse(1)?,
                    low: parse(2)?,
                    close: parse(3)?,
                    average: parse(4)?,
                    median: parse(5)?,
                    absolute_sum: parse(6)?,
                    count: fields[7]
                        .parse()
                        .map_err(|_| EngineError::Malformed(format!("unit tick '{}'", s)))?,
                })
            }
            _ => Err(EngineError::Malformed(format!(
                "unit tick has {} fields",
                fields.len()
            ))),
        }
    }

    pub fn csv_cells(
        tick: Option<&UnitTick>,
        decimals: i8,
        req: &CsvRequirement,
        scale: &TimeScale,
    ) -> Vec<String> {
        let mut cells = Vec::new();
        let (time, unit) = match tick {
            Some(t) => (t.time, t.unit),
            None => (TimeUnit::ZERO, Unit::default()),
        };

        if req.contains(TIME) {
            cells.push(super::render_time_cell(time, scale));
        }
        if req.contains(OPEN) {
            cells.push(if unit.count > 1 {
                format_float(unit.open, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(HIGH) {
            cells.push(if unit.count > 1 {
                format_float(unit.high, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(LOW) {
            cells.push(if unit.count > 1 {
                format_float(unit.low, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(CLOSE) {
            cells.push(if unit.count > 0 {
                format_float(unit.close, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(AVERAGE) {
            cells.push(if unit.count > 1 {
                format_float(unit.average, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(MEDIAN) {
            cells.push(if unit.count > 1 {
                format_float(unit.median, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(ABSOLUTE_SUM) {
            cells.push(if unit.absolute_sum != 0.0 {
                format_float(unit.absolute_sum, decimals)
            } else {
                String::new()
            });
        }
        if req.contains(COUNT) {
            cells.push(if unit.count > 0 {
                unit.count.to_string()
            } else {
                String::new()
            });
        }
        cells
    }
}

/// Fold a run of candles into one. `absolute_sum` follows two regimes: when
/// the inputs come from the base timeframe, it accumulates the absolute
/// difference between consecutive non-empty closes; when the inputs are
/// already aggregated (or raw single samples being folded into base buckets),
/// it sums the children's own `absolute_sum`. Both paths run on decimal
/// arithmetic so millions of small diffs cannot drift.
pub fn aggregate_units(list: &[UnitTick], mode: AbsoluteSumMode) -> Unit {
    let mut ret = Unit::default();
    let mut closes: Vec<f64> = Vec::new();

    let mut absolute_sum = Decimal::ZERO;
    let mut absolute_sum_decimals: u32 = 0;
    let mut max_close_precision: u32 = 0;
    let mut prev_close: Option<f64> = None;

    for tick in list {
        let unit = &tick.unit;
        if unit.count == 0 || unit.open == 0.0 {
            continue;
        }
        let close_precision = precision_of(unit.close);
        max_close_precision = max_close_precision.max(close_precision);

        match mode {
            AbsoluteSumMode::DiffOfCloses => {
                if let Some(prev) = prev_close {
                    if prev != unit.close {
                        absolute_sum_decimals = absolute_sum_decimals.max(close_precision);
                        let hi = Decimal::from_f64(prev.max(unit.close)).unwrap_or_default();
                        let lo = Decimal::from_f64(prev.min(unit.close)).unwrap_or_default();
                        absolute_sum += hi - lo;
                    }
                }
            }
            AbsoluteSumMode::SumOfChildren => {
                absolute_sum_decimals =
                    absolute_sum_decimals.max(precision_of(unit.absolute_sum));
                absolute_sum += Decimal::from_f64(unit.absolute_sum).unwrap_or_default();
            }
        }

        if ret.open == 0.0 {
            ret.open = unit.open;
        }
        if ret.high == 0.0 {
            ret.high = unit.high;
        } else {
            ret.high = ret.high.max(unit.high);
        }
        if ret.low == 0.0 {
            ret.low = unit.low;
        } else if unit.low != 0.0 {
            ret.low = ret.low.min(unit.low);
        }
        ret.close = unit.close;
        ret.count += unit.count;
        closes.push(unit.close);
        prev_close = Some(unit.close);
    }

    ret.absolute_sum = absolute_sum
        .round_dp(absolute_sum_decimals)
        .to_f64()
        .unwrap_or(0.0);
    ret.average = round_to(safe_average(&closes), max_close_precision);
    ret.median = safe_median(&closes);
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(t: i64, close: f64) -> UnitTick {
        Unit::from_value(close).at(TimeUnit::new(t))
    }

    #[test]
    fn raw_round_trip_short_form() {
        let u = Unit::from_value(42.5);
        let raw = u.to_raw(-1);
        assert_eq!(raw, b"42.5");
        assert_eq!(Unit::parse_raw(&raw).unwrap(), u);
    }

    #[test]
    fn raw_round_trip_long_form() {
        let list = vec![tick(0, 10.0), tick(1, 12.5)];
        let agg = aggregate_units(&list, AbsoluteSumMode::DiffOfCloses);
        let raw = agg.to_raw(-1);
        assert_eq!(Unit::parse_raw(&raw).unwrap(), agg);
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(Unit::parse_raw(b"1@2@3").is_err());
        assert!(Unit::parse_raw(b"abc").is_err());
    }

    #[test]
    fn diff_of_closes_accumulates_movement() {
        let closes = [100.0, 101.0, 100.0, 102.0, 100.0];
        let list: Vec<UnitTick> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| tick(i as i64, c))
            .collect();
        let agg = aggregate_units(&list, AbsoluteSumMode::DiffOfCloses);
        assert_eq!(agg.absolute_sum, 1.0 + 1.0 + 2.0 + 2.0);
        assert_eq!(agg.open, 100.0);
        assert_eq!(agg.close, 100.0);
        assert_eq!(agg.high, 102.0);
        assert_eq!(agg.low, 100.0);
        assert_eq!(agg.count, 5);
    }

    #[test]
    fn sum_of_children_ignores_close_movement() {
        let list = vec![tick(0, 10.0), tick(1, 12.0)];
        let agg = aggregate_units(&list, AbsoluteSumMode::SumOfChildren);
        assert_eq!(agg.absolute_sum, 0.0);
        assert_eq!(agg.average, 11.0);
        assert_eq!(agg.median, 11.0);
    }

    #[test]
    fn average_rounds_to_max_input_precision() {
        let list = vec![tick(0, 10.25), tick(1, 10.5), tick(2, 10.0)];
        let agg = aggregate_units(&list, AbsoluteSumMode::DiffOfCloses);
        assert_eq!(agg.average, 10.25);
    }

    #[test]
    fn empty_candles_are_skipped() {
        let list = vec![
            Unit::default().at(TimeUnit::new(0)),
            tick(1, 7.0),
        ];
        let agg = aggregate_units(&list, AbsoluteSumMode::DiffOfCloses);
        assert_eq!(agg.open, 7.0);
        assert_eq!(agg.count, 1);
    }
}
