//! Float formatting and safe statistics shared by the tick variants.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Format a float with a fixed number of decimal places. A negative
/// `decimals` means full precision with trailing zeros trimmed.
pub fn format_float(v: f64, decimals: i8) -> String {
    if decimals < 0 {
        return format!("{}", v);
    }
    format!("{:.*}", decimals as usize, v)
}

/// Number of significant decimal places in `v` once trailing zeros are
/// trimmed.
pub fn precision_of(v: f64) -> u32 {
    let s = format_float(v, -1);
    match s.find('.') {
        Some(pos) => (s.len() - pos - 1) as u32,
        None => 0,
    }
}

pub fn round_to(v: f64, precision: u32) -> f64 {
    match Decimal::from_f64(v) {
        Some(d) => d.round_dp(precision).to_f64().unwrap_or(v),
        None => v,
    }
}

/// Arithmetic mean; empty input yields 0 rather than an error.
pub fn safe_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median; empty input yields 0 rather than an error.
pub fn safe_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_full_precision_without_trailing_zeros() {
        assert_eq!(format_float(11.0, -1), "11");
        assert_eq!(format_float(0.25, -1), "0.25");
        assert_eq!(format_float(10.5, 2), "10.50");
        assert_eq!(format_float(10.567, 2), "10.57");
    }

    #[test]
    fn precision_counts_decimal_digits() {
        assert_eq!(precision_of(10.0), 0);
        assert_eq!(precision_of(10.25), 2);
        assert_eq!(precision_of(0.001), 3);
    }

    #[test]
    fn safe_stats_tolerate_empty_input() {
        assert_eq!(safe_average(&[]), 0.0);
        assert_eq!(safe_median(&[]), 0.0);
        assert_eq!(safe_average(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(safe_median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(safe_median(&[3.0, 1.0, 2.0]), 2.0);
    }
}
