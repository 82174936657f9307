//! Signed-split tick variant: positive and negative magnitudes tracked on
//! independent sides. Additive and mergeable; it carries no absolute-sum
//! notion (that field is defined for Unit only).

use serde::{Deserialize, Serialize};

use super::numeric::{format_float, safe_average, safe_median};
use super::CsvRequirement;
use crate::core::{EngineError, EngineResult, TimeScale, TimeUnit};

pub const PLUS: &str = "plus";
pub const MINUS: &str = "minus";
pub const PLUS_AVERAGE: &str = "plus_average";
pub const MINUS_AVERAGE: &str = "minus_average";
pub const PLUS_MEDIAN: &str = "plus_median";
pub const MINUS_MEDIAN: &str = "minus_median";
pub const PLUS_COUNT: &str = "plus_count";
pub const MINUS_COUNT: &str = "minus_count";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quantity {
    pub plus: f64,
    pub minus: f64,
    pub plus_avg: f64,
    pub minus_avg: f64,
    pub plus_med: f64,
    pub minus_med: f64,
    pub plus_count: i64,
    pub minus_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantityTick {
    pub time: TimeUnit,
    pub quantity: Quantity,
}

impl Quantity {
    /// A single signed sample lands on its sign's side; zero is empty.
    pub fn from_value(v: f64) -> Quantity {
        if v == 0.0 {
            return Quantity::default();
        }
        let abs = v.abs();
        let mut q = Quantity::default();
        if v > 0.0 {
            q.plus = abs;
            q.plus_avg = abs;
            q.plus_med = abs;
            q.plus_count = 1;
        } else {
            q.minus = abs;
            q.minus_avg = abs;
            q.minus_med = abs;
            q.minus_count = 1;
        }
        q
    }

    pub fn is_empty(&self) -> bool {
        self.plus_count == 0 && self.minus_count == 0
    }

    /// Signed extremes: the minus side counts below zero.
    pub fn min(&self) -> f64 {
        -self.minus
    }

    pub fn max(&self) -> f64 {
        self.plus
    }

    pub fn net(&self) -> f64 {
        self.plus - self.minus
    }

    pub fn at(self, time: TimeUnit) -> QuantityTick {
        QuantityTick {
            time,
            quantity: self,
        }
    }

    pub fn to_raw(&self, decimals: i8) -> Vec<u8> {
        if self.plus_count + self.minus_count == 1 {
            if self.plus > 0.0 {
                return format_float(self.plus, decimals).into_bytes();
            }
            return format_float(-self.minus, decimals).into_bytes();
        }
        format!(
            "{}@{}@{}@{}@{}@{}@{}@{}",
            format_float(self.plus, decimals),
            format_float(self.minus, decimals),
            format_float(self.plus_avg, decimals),
            format_float(self.minus_avg, decimals),
            format_float(self.plus_med, decimals),
            format_float(self.minus_med, decimals),
            self.plus_count,
            self.minus_count
        )
        .into_bytes()
    }

    pub fn parse_raw(raw: &[u8]) -> EngineResult<Quantity> {
        let s = std::str::from_utf8(raw)
            .map_err(|_| EngineError::Malformed("quantity tick is not utf-8".to_string()))?;
        let fields: Vec<&str> = s.split('@').collect();
        match fields.len() {
            1 => {
                let v: f64 = fields[0]
                    .parse()
                    .map_err(|_| EngineError::Malformed(format!("quantity tick '{}'", s)))?;
                Ok(Quantity::from_value(v))
            }
            8 => {
                let parse = |i: usize| -> EngineResult<f64> {
                    fields[i]
                        .parse()
                        .map_err(|_| EngineError::Malformed(format!("quantity tick '{}'", s)))
                };
                let parse_count = |i: usize| -> EngineResult<i64> {
                    fields[i]
                        .parse()
                        .map_err(|_| EngineError::Malformed(format!("quantity tick '{}'", s)))
                };
                Ok(Quantity {
                    plus: parse(0)?,
                    minus: parse(1)?,
                    plus_avg: parse(2)?,
                    minus_avg: parse(3)?,
                    plus_med: parse(4)?,
                    minus_med: parse(5)?,
                    plus_count: parse_count(6)?,
                    minus_count: parse_count(7)?,
                })
            }
            _ => Err(EngineError::Malformed(format!(
                "quantity tick has {} fields",
                fields.len()
            ))),
        }
    }

    pub fn csv_cells(
        tick: Option<&QuantityTick>,
        decimals: i8,
        req: &CsvRequirement,
        scale: &TimeScale,
    ) -> Vec<String> {
        let (time, q) = match tick {
            Some(t) => (t.time, t.quantity),
            None => (TimeUnit::ZERO, Quantity::default()),
        };
        let mut cells = Vec::new();
        let float_cell = |v: f64| {
            if v != 0.0 {
                format_float(v, decimals)
            } else {
                String::new()
            }
        };
        let count_cell = |c: i64| {
            if c != 0 {
                c.to_string()
            } else {
                String::new()
            }
        };

        if req.contains(super::unit::TIME) {
            cells.push(super::render_time_cell(time, scale));
        }
        if req.contains(PLUS) {
            cells.push(float_cell(q.plus));
        }
        if req.contains(MINUS) {
            cells.push(float_cell(q.minus));
        }
        if req.contains(PLUS_AVERAGE) {
            cells.push(float_cell(q.plus_avg));
        }
        if req.contains(MINUS_AVERAGE) {
            cells.push(float_cell(q.minus_avg));
        }
        if req.contains(PLUS_MEDIAN) {
            cells.push(float_cell(q.plus_med));
        }
        if req.contains(MINUS_MEDIAN) {
            cells.push(float_cell(q.minus_med));
        }
        if req.contains(PLUS_COUNT) {
            cells.push(count_cell(q.plus_count));
        }
        if req.contains(MINUS_COUNT) {
            cells.push(count_cell(q.minus_count));
        }
        cells
    }
}

/// Merge a run of quantities: each side sums independently, with its own
/// count, mean and median over the contributing magnitudes.
pub fn aggregate_quantities(list: &[QuantityTick]) -> Quantity {
    let mut ret = Quantity::default();
    let mut plus_amounts: Vec<f64> = Vec::new();
    let mut minus_amounts: Vec<f64> = Vec::new();

    for tick in list {
        let q = &tick.quantity;
        if q.plus > 0.0 {
            ret.plus += q.plus;
            ret.plus_count += 1;
            plus_amounts.push(q.plus);
        }
        if q.minus > 0.0 {
            ret.minus += q.minus;
            ret.minus_count += 1;
            minus_amounts.push(q.minus);
        }
    }

    ret.plus_avg = safe_average(&plus_amounts);
    ret.minus_avg = safe_average(&minus_amounts);
    ret.plus_med = safe_median(&plus_amounts);
    ret.minus_med = safe_median(&minus_amounts);
    ret
}
