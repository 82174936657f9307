//! Aggregation semantics over realistic runs of ticks.

use tick_indexer::core::TimeUnit;
use tick_indexer::models::{
    aggregate_quantities, aggregate_units, AbsoluteSumMode, Quantity, Unit,
};

fn units_from_closes(closes: &[f64]) -> Vec<tick_indexer::models::UnitTick> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Unit::from_value(c).at(TimeUnit::new(i as i64)))
        .collect()
}

#[test]
fn minute_candle_accumulates_absolute_movement() {
    // Sixty one-second closes cycling 100, 101, 100, 102.
    let pattern = [100.0, 101.0, 100.0, 102.0];
    let closes: Vec<f64> = (0..60).map(|i| pattern[i % 4]).collect();

    let mut expected = 0.0;
    for pair in closes.windows(2) {
        expected += (pair[1] - pair[0]).abs();
    }

    let agg = aggregate_units(&units_from_closes(&closes), AbsoluteSumMode::DiffOfCloses);
    assert_eq!(agg.absolute_sum, expected);
    assert_eq!(agg.high, 102.0);
    assert_eq!(agg.low, 100.0);
    assert_eq!(agg.count, 60);
    assert_eq!(agg.open, 100.0);
    assert_eq!(agg.close, pattern[59 % 4]);
}

#[test]
fn absolute_sum_stays_decimal_exact_over_many_small_moves() {
    // 0.1-sized moves accumulate drift under naive float summation.
    let closes: Vec<f64> = (0..1_000)
        .map(|i| if i % 2 == 0 { 0.1 } else { 0.2 })
        .collect();
    let agg = aggregate_units(&units_from_closes(&closes), AbsoluteSumMode::DiffOfCloses);
    assert_eq!(agg.absolute_sum, 99.9);
}

#[test]
fn unchanged_closes_contribute_no_movement() {
    let closes = vec![100.0, 100.0, 100.0, 101.0, 101.0];
    let agg = aggregate_units(&units_from_closes(&closes), AbsoluteSumMode::DiffOfCloses);
    assert_eq!(agg.absolute_sum, 1.0);
}

#[test]
fn higher_timeframe_fold_sums_child_movement() {
    // Two minute-candles with their own absolute sums fold into an hour.
    let mut a = Unit::from_value(100.0);
    a.count = 60;
    a.absolute_sum = 12.5;
    let mut b = Unit::from_value(101.0);
    b.count = 60;
    b.absolute_sum = 7.25;

    let agg = aggregate_units(
        &[a.at(TimeUnit::new(60)), b.at(TimeUnit::new(120))],
        AbsoluteSumMode::SumOfChildren,
    );
    assert_eq!(agg.absolute_sum, 19.75);
    assert_eq!(agg.count, 120);
}

#[test]
fn quantity_merge_is_associative_across_splits() {
    let samples = [5.0, -3.0, 2.0, -1.5, 4.25, -0.25];
    let ticks: Vec<_> = samples
        .iter()
        .enumerate()
        .map(|(i, &v)| Quantity::from_value(v).at(TimeUnit::new(i as i64)))
        .collect();

    let whole = aggregate_quantities(&ticks);

    let left = aggregate_quantities(&ticks[..3]);
    let right = aggregate_quantities(&ticks[3..]);
    let merged = aggregate_quantities(&[left.at(TimeUnit::new(2)), right.at(TimeUnit::new(5))]);

    assert_eq!(whole.plus, merged.plus);
    assert_eq!(whole.minus, merged.minus);
    assert_eq!(whole.net(), merged.net());
}

#[test]
fn quantity_sides_report_their_own_statistics() {
    let ticks = vec![
        Quantity::from_value(5.0).at(TimeUnit::new(0)),
        Quantity::from_value(-3.0).at(TimeUnit::new(1)),
        Quantity::from_value(1.0).at(TimeUnit::new(2)),
    ];
    let agg = aggregate_quantities(&ticks);
    assert_eq!(agg.plus, 6.0);
    assert_eq!(agg.plus_count, 2);
    assert_eq!(agg.plus_avg, 3.0);
    assert_eq!(agg.plus_med, 3.0);
    assert_eq!(agg.minus, 3.0);
    assert_eq!(agg.minus_count, 1);
    assert_eq!(agg.minus_med, 3.0);
}
