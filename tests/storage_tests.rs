//! Tick store behavior: ordering, watermarks, carry records, limit reads
//! and rollback.

mod common;

use common::*;
use tick_indexer::core::{TimeUnit, Timeframe};
use tick_indexer::database::keys;
use tick_indexer::sets::DataLimitQuery;

#[tokio::test]
async fn range_reads_are_half_open_and_ascending() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let t0 = day(&rig, MIN_DATE);

    store_values(&price, base(&rig), t0, 1, &[10.0, 11.0, 12.0], t0 + 3, b"d1");

    let list = price.get_in_range(base(&rig), t0, t0 + 2).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.time_at(0), Some(t0));
    assert_eq!(list.time_at(1), Some(t0 + 1));
    assert_eq!(unit_of(list.value_at(0).unwrap()).close, 10.0);
    assert_eq!(unit_of(list.value_at(1).unwrap()).close, 11.0);
}

#[tokio::test]
async fn store_writes_carry_before_watermark() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let t0 = day(&rig, MIN_DATE);
    let day_end = t0 + rig.config.scale.day_units();

    store_values(&price, base(&rig), t0, 1, &[10.0], day_end, b"carry-a");

    // The carry record for the watermark's covered day must exist on disk.
    let record = price
        .db()
        .get(&keys::prev_state_key(price.key(), "1s", MIN_DATE))
        .unwrap();
    assert!(record.is_some());
    assert_eq!(
        price.last_consistency_time(base(&rig)).unwrap(),
        day_end
    );
    assert_eq!(
        price.last_prev_state_cached(base(&rig)).unwrap().state(),
        b"carry-a"
    );
}

#[tokio::test]
async fn watermark_only_moves_forward_outside_rollback() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let t0 = day(&rig, MIN_DATE);

    store_values(&price, base(&rig), t0, 1, &[10.0], t0 + 100, b"a");
    let first = price.last_consistency_time(base(&rig)).unwrap();
    store_values(&price, base(&rig), t0 + 100, 1, &[11.0], t0 + 200, b"b");
    let second = price.last_consistency_time(base(&rig)).unwrap();
    assert!(second > first);
    assert_eq!(
        price.last_consistency_time_cached(base(&rig)).unwrap(),
        second
    );
}

#[tokio::test]
async fn zero_watermark_is_rejected() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let err = price.store(
        &Default::default(),
        base(&rig),
        &tick_indexer::models::PrevState::new(),
        TimeUnit::ZERO,
    );
    assert!(err.is_err());
}

#[tokio::test]
async fn limit_reads_walk_both_directions() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");
    let t0 = day(&rig, MIN_DATE);

    store_values(
        &price,
        base(&rig),
        t0,
        1,
        &[1.0, 2.0, 3.0, 4.0, 5.0],
        t0 + 5,
        b"d",
    );

    let forward = price
        .get_data_limit(
            DataLimitQuery {
                timeframe: base(&rig),
                limit: 3,
                offset: t0,
                start_by_end: false,
            },
            false,
        )
        .unwrap();
    assert_eq!(forward.len(), 3);
    assert_eq!(forward.time_at(0), Some(t0));
    assert_eq!(forward.time_at(2), Some(t0 + 2));

    // Reverse skips the seed key when it matches the offset exactly.
    let reverse = price
        .get_data_limit(
            DataLimitQuery {
                timeframe: base(&rig),
                limit: 2,
                offset: t0 + 4,
                start_by_end: true,
            },
            false,
        )
        .unwrap();
    assert_eq!(reverse.len(), 2);
    assert_eq!(reverse.time_at(0), Some(t0 + 2));
    assert_eq!(reverse.time_at(1), Some(t0 + 3));

    let earliest = price.earliest_tick(base(&rig)).unwrap().unwrap();
    assert_eq!(earliest.0, t0);
    let latest = price.latest_tick(base(&rig)).unwrap().unwrap();
    assert_eq!(latest.0, t0 + 4);
}

fn date_of(i: i64) -> String {
    format!("2023-11-{:02}", 14 + i)
}

async fn ingest_week(rig: &TestRig) -> std::sync::Arc<tick_indexer::sets::AssetState> {
    let set = open_stream_set(rig).await;
    let price = find_by_type(&set, "price");
    let day_units = rig.config.scale.day_units();

    for i in 0..7 {
        let start = day(rig, &date_of(i));
        store_values(
            &price,
            base(rig),
            start,
            1,
            &[10.0 + i as f64, 11.0 + i as f64, 12.0 + i as f64],
            start + day_units,
            date_of(i).as_bytes(),
        );
    }
    price
}

#[tokio::test]
async fn rollback_restores_previous_day_state() {
    let rig = rig().await;
    let price = ingest_week(&rig).await;
    let base_tf = base(&rig);

    price.rollback("2023-11-17", base_tf).await.unwrap();

    let cut = day(&rig, "2023-11-17");
    // Everything at or above the cut is gone; everything below survives.
    let above = price
        .get_in_range(base_tf, cut, day(&rig, "2023-11-21"))
        .unwrap();
    assert!(above.is_empty());
    let below = price
        .get_in_range(base_tf, day(&rig, MIN_DATE), cut)
        .unwrap();
    assert_eq!(below.len(), 9);

    // Watermark sits on the last second of the previous day and the carry
    // is the record written at the close of 2023-11-16.
    assert_eq!(price.last_consistency_time(base_tf).unwrap(), cut - 1);
    assert_eq!(
        price.last_prev_state_cached(base_tf).unwrap().state(),
        b"2023-11-16"
    );

    // The base timeframe stays in the read list.
    assert!(price.active_timeframes().unwrap().contains(&base_tf));
}

#[tokio::test]
async fn rollback_to_min_date_wipes_the_stream() {
    let rig = rig().await;
    let price = ingest_week(&rig).await;
    let base_tf = base(&rig);

    price.rollback(MIN_DATE, base_tf).await.unwrap();

    assert_eq!(
        price.last_consistency_time(base_tf).unwrap(),
        TimeUnit::ZERO
    );
    let all = price
        .get_in_range(base_tf, day(&rig, MIN_DATE), day(&rig, "2023-11-22"))
        .unwrap();
    assert!(all.is_empty());
    assert!(price.active_timeframes().unwrap().contains(&base_tf));
}

#[tokio::test]
async fn rollback_of_a_higher_timeframe_drops_its_read_list_entry() {
    let rig = rig().await;
    let price = ingest_week(&rig).await;
    let minute = Timeframe::MINUTE;

    price.add_if_unfound_in_read_list(minute).unwrap();
    let start = day(&rig, MIN_DATE);
    store_values(&price, minute, start + 60, 60, &[10.5], start + 120, b"m");
    assert!(price.active_timeframes().unwrap().contains(&minute));

    price.rollback(MIN_DATE, minute).await.unwrap();
    assert!(!price.active_timeframes().unwrap().contains(&minute));
    assert!(price
        .get_in_range(minute, start, start + 86_400)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rollback_of_a_higher_timeframe_to_a_later_date_still_wipes() {
    let rig = rig().await;
    let price = ingest_week(&rig).await;
    let minute = Timeframe::MINUTE;
    let start = day(&rig, MIN_DATE);

    price.add_if_unfound_in_read_list(minute).unwrap();
    store_values(
        &price,
        minute,
        start + 60,
        60,
        &[10.5, 11.5, 12.5],
        start + 300,
        b"m",
    );

    // The target date sits strictly after min_data_date; a non-base
    // timeframe still wipes completely rather than rolling back partially.
    price.rollback("2023-11-20", minute).await.unwrap();

    assert!(!price.active_timeframes().unwrap().contains(&minute));
    assert_eq!(
        price.last_consistency_time(minute).unwrap(),
        TimeUnit::ZERO
    );
    assert!(price
        .get_in_range(minute, start, start + 86_400)
        .unwrap()
        .is_empty());

    // The base stream is untouched.
    assert!(price.active_timeframes().unwrap().contains(&base(&rig)));
    assert!(!price
        .last_consistency_time(base(&rig))
        .unwrap()
        .is_zero());
    let base_data = price
        .get_in_range(base(&rig), start, day(&rig, "2023-11-21"))
        .unwrap();
    assert_eq!(base_data.len(), 21);
}

#[tokio::test]
async fn should_sync_reports_the_next_missing_day() {
    let rig = rig().await;
    let set = open_stream_set(&rig).await;
    let price = find_by_type(&set, "price");

    // Nothing ingested yet: the first day is the declared minimum.
    assert_eq!(price.should_sync().unwrap().as_deref(), Some(MIN_DATE));

    let start = day(&rig, MIN_DATE);
    store_values(
        &price,
        base(&rig),
        start,
        1,
        &[1.0],
        start + rig.config.scale.day_units(),
        b"d",
    );
    // Far in the past relative to now: still out of date.
    assert_eq!(
        price.should_sync().unwrap().as_deref(),
        Some("2023-11-15")
    );
    assert!(!price.is_consistent(base(&rig)).unwrap());
}

#[tokio::test]
async fn read_list_survives_reopen() {
    let rig = rig().await;
    {
        let set = open_stream_set(&rig).await;
        let price = find_by_type(&set, "price");
        price
            .add_if_unfound_in_read_list(Timeframe::MINUTE)
            .unwrap();
    }
    rig.manager.remove(SET_ID).unwrap();

    let set = rig
        .manager
        .add(stream_settings(), true)
        .await
        .unwrap()
        .unwrap();
    let price = find_by_type(&set, "price");
    let tfs = price.active_timeframes().unwrap();
    assert!(tfs.contains(&Timeframe::SECOND));
    assert!(tfs.contains(&Timeframe::MINUTE));
}
