//! End-to-end aggregation and indicator indexing through the task engine.

mod common;

use common::*;
use tick_indexer::core::Timeframe;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn base_ticks_aggregate_into_minute_candles() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let start = day(&rig, MIN_DATE);

    // Two minutes of one-second closes, consistent through five minutes.
    let closes: Vec<f64> = (0..120)
        .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
        .collect();
    store_values(&price, base(&rig), start, 1, &closes, start + 300, b"base");

    rig.engine
        .add_timeframe_indexing(&price, Timeframe::MINUTE)
        .unwrap();
    let handle = rig.engine.start();
    wait_idle(&rig.engine).await;

    let candles = price
        .get_in_range(Timeframe::MINUTE, start, start + 301)
        .unwrap();
    assert_eq!(candles.len(), 2);

    // Buckets close at their end timestamp.
    assert_eq!(candles.time_at(0), Some(start + 60));
    assert_eq!(candles.time_at(1), Some(start + 120));

    let first = unit_of(candles.value_at(0).unwrap());
    assert_eq!(first.count, 60);
    assert_eq!(first.open, 100.0);
    assert_eq!(first.close, 101.0);
    assert_eq!(first.high, 101.0);
    assert_eq!(first.low, 100.0);
    // 59 alternating transitions of magnitude 1.
    assert_eq!(first.absolute_sum, 59.0);

    // The minute watermark advanced and the timeframe is registered.
    assert!(price
        .active_timeframes()
        .unwrap()
        .contains(&Timeframe::MINUTE));
    assert!(price
        .last_consistency_time(Timeframe::MINUTE)
        .unwrap()
        .int()
        >= (start + 120).int());

    rig.engine.quit();
    handle.await.ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reindexing_a_synced_timeframe_is_a_no_op() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let start = day(&rig, MIN_DATE);

    let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i % 3) as f64).collect();
    store_values(&price, base(&rig), start, 1, &closes, start + 180, b"base");

    rig.engine
        .add_timeframe_indexing(&price, Timeframe::MINUTE)
        .unwrap();
    let handle = rig.engine.start();
    wait_idle(&rig.engine).await;
    let first_pass = price
        .get_in_range(Timeframe::MINUTE, start, start + 301)
        .unwrap();

    rig.engine
        .add_timeframe_indexing(&price, Timeframe::MINUTE)
        .unwrap();
    wait_idle(&rig.engine).await;
    let second_pass = price
        .get_in_range(Timeframe::MINUTE, start, start + 301)
        .unwrap();

    assert_eq!(first_pass, second_pass);
    rig.engine.quit();
    handle.await.ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indicator_merges_aligned_dependency_samples() {
    let rig = rig().await;
    let set = open_indicator_set(&rig).await;
    let price = find_by_type(&set, "price");
    let volume = find_by_type(&set, "volume");
    let vwap = find_by_type(&set, "vwap");
    let start = day(&rig, MIN_DATE);
    let minute = Timeframe::MINUTE;

    // Minute-level dependency streams, consistent through three minutes.
    price.add_if_unfound_in_read_list(minute).unwrap();
    volume.add_if_unfound_in_read_list(minute).unwrap();
    store_values(&price, minute, start + 60, 60, &[10.0, 11.0], start + 180, b"p");
    store_values(&volume, minute, start + 60, 60, &[2.0, 5.0], start + 180, b"v");

    rig.engine.add_indicator_indexing(&vwap, minute).unwrap();
    let handle = rig.engine.start();
    wait_idle(&rig.engine).await;

    let points = vwap.get_in_range(minute, start, start + 181).unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points.time_at(0), Some(start + 60));
    assert_eq!(points.time_at(1), Some(start + 120));

    // First output sees (10, 2); the second's carry reflects the first:
    // (10*2 + 11*5) / (2 + 5).
    assert_eq!(point_of(points.value_at(0).unwrap()).value, 10.0);
    let second = point_of(points.value_at(1).unwrap()).value;
    assert!((second - 75.0 / 7.0).abs() < 1e-12);

    // The indicator watermark reached the dependency minimum.
    assert_eq!(
        vwap.last_consistency_time(minute).unwrap(),
        start + 180
    );

    rig.engine.quit();
    handle.await.ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indicator_replays_last_known_sample_for_missing_timestamps() {
    let rig = rig().await;
    let set = open_indicator_set(&rig).await;
    let price = find_by_type(&set, "price");
    let volume = find_by_type(&set, "volume");
    let vwap = find_by_type(&set, "vwap");
    let start = day(&rig, MIN_DATE);
    let minute = Timeframe::MINUTE;

    price.add_if_unfound_in_read_list(minute).unwrap();
    volume.add_if_unfound_in_read_list(minute).unwrap();
    // Price ticks at +60 and +120; volume only at +60. At +120 the merge
    // must replay volume's last-known sample.
    store_values(&price, minute, start + 60, 60, &[10.0, 12.0], start + 180, b"p");
    store_values(&volume, minute, start + 60, 60, &[3.0], start + 180, b"v");

    rig.engine.add_indicator_indexing(&vwap, minute).unwrap();
    let handle = rig.engine.start();
    wait_idle(&rig.engine).await;

    let points = vwap.get_in_range(minute, start, start + 181).unwrap();
    assert_eq!(points.len(), 2);
    // (10*3) / 3 then (10*3 + 12*3) / 6.
    assert_eq!(point_of(points.value_at(0).unwrap()).value, 10.0);
    assert_eq!(point_of(points.value_at(1).unwrap()).value, 11.0);

    rig.engine.quit();
    handle.await.ok();
}
