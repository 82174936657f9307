//! Single-value tick variant; indicator output. Not aggregatable.

use serde::{Deserialize, Serialize};

use super::numeric::format_float;
use super::CsvRequirement;
use crate::core::{EngineError, EngineResult, TimeScale, TimeUnit};

pub const VALUE: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointTick {
    pub time: TimeUnit,
    pub point: Point,
}

impl Point {
    pub fn new(value: f64) -> Point {
        Point { value }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0.0
    }

    pub fn at(self, time: TimeUnit) -> PointTick {
        PointTick { time, point: self }
    }

    pub fn to_raw(&self, decimals: i8) -> Vec<u8> {
        format_float(self.value, decimals).into_bytes()
    }

    pub fn parse_raw(raw: &[u8]) -> EngineResult<Point> {
        if raw.is_empty() {
            return Ok(Point::default());
        }
        let s = std::str::from_utf8(raw)
            .map_err(|_| EngineError::Malformed("point tick is not utf-8".to_string()))?;
        let value: f64 = s
            .parse()
            .map_err(|_| EngineError::Malformed(format!("point tick '{}'", s)))?;
        Ok(Point { value })
    }

    pub fn csv_cells(
        tick: Option<&PointTick>,
        decimals: i8,
        req: &CsvRequirement,
        scale: &TimeScale,
    ) -> Vec<String> {
        let (time, p) = match tick {
            Some(t) => (t.time, t.point),
            None => (TimeUnit::ZERO, Point::default()),
        };
        let mut cells = Vec::new();
        if req.contains(super::unit::TIME) {
            cells.push(super::render_time_cell(time, scale));
        }
        if req.contains(VALUE) {
            cells.push(if p.value != 0.0 {
                format_float(p.value, decimals)
            } else {
                String::new()
            });
        }
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        let p = Point::new(0.125);
        assert_eq!(Point::parse_raw(&p.to_raw(-1)).unwrap(), p);
    }

    #[test]
    fn empty_bytes_decode_to_empty_point() {
        assert!(Point::parse_raw(b"").unwrap().is_empty());
    }
}
