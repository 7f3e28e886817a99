use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::collections::BTreeSet;

use radio_dash::manifest::{ManifestBuilder, ManifestSettings};
use radio_dash::model::{Media, Segment, NO_LIVE};
use radio_dash::store::Store;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn settings(dir: &std::path::Path) -> ManifestSettings {
    ManifestSettings {
        path: dir.join("manifest.mpd"),
        chunk_length: TimeDelta::seconds(2),
        buffer_time: TimeDelta::seconds(30),
        buffer_depth: TimeDelta::seconds(5),
        minimum_update_period: TimeDelta::seconds(10),
        utc_timing_url: "https://time.example.com/?iso&ms".to_string(),
    }
}

/// Period ids in document order
fn period_ids(mpd: &str) -> Vec<u64> {
    mpd.split("<Period id=\"")
        .skip(1)
        .map(|rest| rest.split('"').next().unwrap().parse().unwrap())
        .collect()
}

async fn schedule_back_to_back(store: &Store, count: i64, secs: i64) {
    let media_id = store
        .new_media(&Media {
            id: 0,
            name: "loop".to_string(),
            author: String::new(),
            duration: TimeDelta::seconds(secs),
            source_id: "loop".to_string(),
            tags: BTreeSet::new(),
        })
        .await
        .unwrap();
    for i in 0..count {
        store
            .save_segment(&Segment {
                id: 0,
                media_id,
                start: t0() + TimeDelta::seconds(i * secs),
                begin_cut: TimeDelta::zero(),
                stop_cut: TimeDelta::seconds(secs),
                protected: false,
                live_id: NO_LIVE,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_period_ids_grow_across_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    schedule_back_to_back(&store, 10, 10).await;

    let horizon = TimeDelta::seconds(20);
    let mut builder = ManifestBuilder::with_start_time(settings(dir.path()), t0());

    let now = t0() + TimeDelta::seconds(1);
    let window = store.schedule_cut(now, now + horizon).await.unwrap();
    builder.set_schedule(&window, now);
    let first = period_ids(&builder.render());
    assert_eq!(first, vec![1, 2, 3]);

    let now = now + TimeDelta::seconds(30);
    let window = store.schedule_cut(now, now + horizon).await.unwrap();
    builder.set_schedule(&window, now);
    let second = period_ids(&builder.render());
    assert_eq!(second.len(), 3);

    let newest_first = *first.iter().max().unwrap();
    assert!(second.iter().all(|id| *id > newest_first), "{:?} vs {:?}", second, first);
    assert!(second.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_shared_periods_never_lose_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    schedule_back_to_back(&store, 20, 10).await;

    let horizon = TimeDelta::seconds(60);
    let mut builder = ManifestBuilder::with_start_time(settings(dir.path()), t0());
    let mut previous: Vec<(i64, u64)> = Vec::new();
    let mut last_played = 0;

    for step in 0..12 {
        let now = t0() + TimeDelta::milliseconds(500 + step * 7_300);
        let window = store.schedule_cut(now, now + horizon).await.unwrap();
        builder.set_schedule(&window, now);
        assert!(builder.last_played_period() >= last_played);
        last_played = builder.last_played_period();

        let current: Vec<(i64, u64)> = builder
            .periods()
            .iter()
            .map(|p| (p.segment_id, p.id))
            .collect();
        for (segment_id, id) in &current {
            if let Some((_, old)) = previous.iter().find(|(s, _)| s == segment_id) {
                assert!(id >= old, "segment {} went from period {} to {}", segment_id, old, id);
            }
        }
        previous = current;
    }
}

#[test]
fn test_inserted_segment_takes_the_id_at_its_position() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ManifestBuilder::with_start_time(settings(dir.path()), t0());
    let segment = |id: i64, offset: i64| Segment {
        id,
        media_id: 1,
        start: t0() + TimeDelta::seconds(offset),
        begin_cut: TimeDelta::zero(),
        stop_cut: TimeDelta::seconds(10),
        protected: false,
        live_id: NO_LIVE,
    };
    let now = t0() + TimeDelta::seconds(1);
    let ids = |builder: &ManifestBuilder| -> Vec<(i64, u64)> {
        builder.periods().iter().map(|p| (p.segment_id, p.id)).collect()
    };

    builder.set_schedule(&[segment(1, 0), segment(3, 20)], now);
    assert_eq!(ids(&builder), vec![(1, 1), (3, 2)]);

    // Ids are positional: the newcomer takes 2 and the later period moves up
    builder.set_schedule(&[segment(1, 0), segment(2, 10), segment(3, 20)], now);
    assert_eq!(ids(&builder), vec![(1, 1), (2, 2), (3, 3)]);
    assert_eq!(builder.last_played_period(), 0);
}

#[tokio::test]
async fn test_dump_writes_manifest_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    schedule_back_to_back(&store, 2, 10).await;

    let mut builder = ManifestBuilder::with_start_time(settings(dir.path()), t0());
    let now = t0();
    let window = store.schedule_cut(now, now + TimeDelta::seconds(60)).await.unwrap();
    builder.set_schedule(&window, now);
    builder.dump().await.unwrap();

    let written = std::fs::read_to_string(dir.path().join("manifest.mpd")).unwrap();
    assert!(written.contains("type=\"dynamic\""));
    assert!(written.contains("availabilityStartTime=\"2030-01-01T00:00:00Z\""));
    assert!(written.contains("initialization=\"1/init.m4s\""));
    assert!(written.contains("media=\"2/chunk-$Number%05d$.m4s\""));
    assert_eq!(period_ids(&written), vec![1, 2]);

    builder.clean_up().await.unwrap();
    assert!(!dir.path().join("manifest.mpd").exists());
    builder.clean_up().await.unwrap();
}
