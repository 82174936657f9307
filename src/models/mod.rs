//! Data model: the three tick variants, their shared sum type, asset
//! addressing and persisted settings.

pub mod address;
pub mod numeric;
pub mod point;
pub mod prev_state;
pub mod quantity;
pub mod settings;
pub mod unit;

pub use address::{AssetAddress, ParsedAddress};
pub use point::{Point, PointTick};
pub use prev_state::PrevState;
pub use quantity::{aggregate_quantities, Quantity, QuantityTick};
pub use settings::{AssetSettings, SetSettings};
pub use unit::{aggregate_units, Unit, UnitTick};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::core::{EngineError, EngineResult, TimeScale, TimeUnit};

pub const TIME: &str = unit::TIME;
pub const VALUE: &str = point::VALUE;

/// Which rule feeds the aggregated candle's `absolute_sum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsoluteSumMode {
    /// Accumulate `|close_i - close_{i-1}|` over consecutive non-empty
    /// closes. Used when aggregating base-timeframe candles upward.
    DiffOfCloses,
    /// Sum the children's own `absolute_sum` fields. Used when folding raw
    /// sub-base samples into base buckets (their children carry 0).
    SumOfChildren,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Unit = 1,
    Quantity = 2,
    Point = 3,
}

impl DataType {
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            DataType::Unit => &[
                unit::TIME,
                unit::OPEN,
                unit::HIGH,
                unit::LOW,
                unit::CLOSE,
                unit::AVERAGE,
                unit::MEDIAN,
                unit::ABSOLUTE_SUM,
                unit::COUNT,
            ],
            DataType::Quantity => &[
                unit::TIME,
                quantity::PLUS,
                quantity::MINUS,
                quantity::PLUS_AVERAGE,
                quantity::MINUS_AVERAGE,
                quantity::PLUS_MEDIAN,
                quantity::MINUS_MEDIAN,
                quantity::PLUS_COUNT,
                quantity::MINUS_COUNT,
            ],
            DataType::Point => &[unit::TIME, point::VALUE],
        }
    }

    /// Header cells for the projected columns. The bare value column takes
    /// the prefix itself; every other column is suffixed.
    pub fn header(self, prefix: &str, req: &CsvRequirement) -> Vec<String> {
        self.columns()
            .iter()
            .filter(|c| req.contains(c))
            .map(|c| {
                if *c == point::VALUE {
                    prefix.to_string()
                } else {
                    format!("{}_{}", prefix, c)
                }
            })
            .collect()
    }

    pub fn is_aggregatable(self) -> bool {
        !matches!(self, DataType::Point)
    }
}

/// Selected columns of one export order.
#[derive(Debug, Clone, Default)]
pub struct CsvRequirement(HashSet<String>);

impl CsvRequirement {
    pub fn new() -> Self {
        CsvRequirement(HashSet::new())
    }

    pub fn from_columns<I: IntoIterator<Item = S>, S: Into<String>>(columns: I) -> Self {
        CsvRequirement(columns.into_iter().map(Into::into).collect())
    }

    pub fn all_for(data_type: DataType) -> Self {
        Self::from_columns(data_type.columns().iter().copied())
    }

    pub fn insert(&mut self, column: impl Into<String>) {
        self.0.insert(column.into());
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }

    /// Requested column names in the data type's canonical order.
    pub fn projected(&self, data_type: DataType) -> Vec<&'static str> {
        data_type
            .columns()
            .iter()
            .copied()
            .filter(|c| self.contains(c))
            .collect()
    }
}

pub(crate) fn render_time_cell(time: TimeUnit, scale: &TimeScale) -> String {
    if time <= TimeUnit::ZERO {
        return String::new();
    }
    if scale.is_second_aligned() {
        scale.unix_seconds(time).to_string()
    } else {
        time.to_string()
    }
}

/// One sample of any variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickValue {
    Unit(Unit),
    Quantity(Quantity),
    Point(Point),
}

impl TickValue {
    pub fn from_value(data_type: DataType, v: f64) -> TickValue {
        match data_type {
            DataType::Unit => TickValue::Unit(Unit::from_value(v)),
            DataType::Quantity => TickValue::Quantity(Quantity::from_value(v)),
            DataType::Point => TickValue::Point(Point::new(v)),
        }
    }

    pub fn parse_raw(data_type: DataType, raw: &[u8]) -> EngineResult<TickValue> {
        Ok(match data_type {
            DataType::Unit => TickValue::Unit(Unit::parse_raw(raw)?),
            DataType::Quantity => TickValue::Quantity(Quantity::parse_raw(raw)?),
            DataType::Point => TickValue::Point(Point::parse_raw(raw)?),
        })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TickValue::Unit(_) => DataType::Unit,
            TickValue::Quantity(_) => DataType::Quantity,
            TickValue::Point(_) => DataType::Point,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TickValue::Unit(u) => u.is_empty(),
            TickValue::Quantity(q) => q.is_empty(),
            TickValue::Point(p) => p.is_empty(),
        }
    }

    pub fn min(&self) -> f64 {
        match self {
            TickValue::Unit(u) => u.min(),
            TickValue::Quantity(q) => q.min(),
            TickValue::Point(p) => p.value,
        }
    }

    pub fn max(&self) -> f64 {
        match self {
            TickValue::Unit(u) => u.max(),
            TickValue::Quantity(q) => q.max(),
            TickValue::Point(p) => p.value,
        }
    }

    /// The representative scalar a dependent indicator reads: close for
    /// candles, net flow for quantities, the value itself for points.
    pub fn scalar(&self) -> f64 {
        match self {
            TickValue::Unit(u) => u.close,
            TickValue::Quantity(q) => q.net(),
            TickValue::Point(p) => p.value,
        }
    }

    pub fn to_raw(&self, decimals: i8) -> Vec<u8> {
        match self {
            TickValue::Unit(u) => u.to_raw(decimals),
            TickValue::Quantity(q) => q.to_raw(decimals),
            TickValue::Point(p) => p.to_raw(decimals),
        }
    }
}

/// A homogeneous, time-ordered run of samples of one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum TickList {
    Units(Vec<UnitTick>),
    Quantities(Vec<QuantityTick>),
    Points(Vec<PointTick>),
}

impl TickList {
    pub fn new(data_type: DataType) -> TickList {
        match data_type {
            DataType::Unit => TickList::Units(Vec::new()),
            DataType::Quantity => TickList::Quantities(Vec::new()),
            DataType::Point => TickList::Points(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TickList::Units(_) => DataType::Unit,
            TickList::Quantities(_) => DataType::Quantity,
            TickList::Points(_) => DataType::Point,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TickList::Units(v) => v.len(),
            TickList::Quantities(v) => v.len(),
            TickList::Points(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, time: TimeUnit, value: TickValue) -> EngineResult<()> {
        match (self, value) {
            (TickList::Units(v), TickValue::Unit(u)) => v.push(u.at(time)),
            (TickList::Quantities(v), TickValue::Quantity(q)) => v.push(q.at(time)),
            (TickList::Points(v), TickValue::Point(p)) => v.push(p.at(time)),
            (list, value) => {
                return Err(EngineError::Malformed(format!(
                    "cannot push {:?} sample into {:?} list",
                    value.data_type(),
                    list.data_type()
                )))
            }
        }
        Ok(())
    }

    pub fn time_at(&self, i: usize) -> Option<TimeUnit> {
        match self {
            TickList::Units(v) => v.get(i).map(|t| t.time),
            TickList::Quantities(v) => v.get(i).map(|t| t.time),
            TickList::Points(v) => v.get(i).map(|t| t.time),
        }
    }

    pub fn value_at(&self, i: usize) -> Option<TickValue> {
        match self {
            TickList::Units(v) => v.get(i).map(|t| TickValue::Unit(t.unit)),
            TickList::Quantities(v) => v.get(i).map(|t| TickValue::Quantity(t.quantity)),
            TickList::Points(v) => v.get(i).map(|t| TickValue::Point(t.point)),
        }
    }

    pub fn last_value(&self) -> Option<(TimeUnit, TickValue)> {
        if self.is_empty() {
            return None;
        }
        let i = self.len() - 1;
        Some((self.time_at(i)?, self.value_at(i)?))
    }

    /// Fold the whole run into one sample. Points refuse aggregation.
    pub fn aggregate(&self, mode: AbsoluteSumMode) -> EngineResult<TickValue> {
        match self {
            TickList::Units(v) => Ok(TickValue::Unit(aggregate_units(v, mode))),
            TickList::Quantities(v) => Ok(TickValue::Quantity(aggregate_quantities(v))),
            TickList::Points(_) => Err(EngineError::Validation(
                "point data cannot be aggregated".to_string(),
            )),
        }
    }

    pub fn to_raw(&self, decimals: i8) -> BTreeMap<TimeUnit, Vec<u8>> {
        let mut ret = BTreeMap::new();
        for i in 0..self.len() {
            if let (Some(t), Some(v)) = (self.time_at(i), self.value_at(i)) {
                ret.insert(t, v.to_raw(decimals));
            }
        }
        ret
    }

    pub fn csv_cells_at(
        &self,
        i: Option<usize>,
        decimals: i8,
        req: &CsvRequirement,
        scale: &TimeScale,
    ) -> Vec<String> {
        match self {
            TickList::Units(v) => {
                unit::Unit::csv_cells(i.and_then(|i| v.get(i)), decimals, req, scale)
            }
            TickList::Quantities(v) => {
                quantity::Quantity::csv_cells(i.and_then(|i| v.get(i)), decimals, req, scale)
            }
            TickList::Points(v) => {
                point::Point::csv_cells(i.and_then(|i| v.get(i)), decimals, req, scale)
            }
        }
    }
}
