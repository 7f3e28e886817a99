use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use radio_dash::autodj::{AutoDj, DjConfig, DjSettings, Stub};
use radio_dash::bus::ChangeBus;
use radio_dash::error::Error;
use radio_dash::model::{Media, Segment, Tag, TagType, NO_LIVE};
use radio_dash::store::Store;

struct Library {
    store: Store,
    bus: ChangeBus,
    tag: i64,
    tracks: Vec<i64>,
    /// Untagged, used for editor reservations
    long: i64,
}

async fn add_media(store: &Store, name: &str, secs: i64, tags: &[i64]) -> i64 {
    store
        .new_media(&Media {
            id: 0,
            name: name.to_string(),
            author: String::new(),
            duration: TimeDelta::seconds(secs),
            source_id: name.to_string(),
            tags: tags.iter().copied().collect::<BTreeSet<i64>>(),
        })
        .await
        .unwrap()
}

async fn library() -> Library {
    let store = Store::in_memory().await.unwrap();
    let tag = store
        .new_tag(&Tag {
            id: 0,
            name: "T".to_string(),
            kind: TagType::Genre,
            metadata: Default::default(),
        })
        .await
        .unwrap();
    let mut tracks = Vec::new();
    for (name, secs) in [("three", 3), ("five", 5), ("four", 4)] {
        tracks.push(add_media(&store, name, secs, &[tag]).await);
    }
    let long = add_media(&store, "long", 60, &[]).await;
    Library {
        store,
        bus: ChangeBus::new(),
        tag,
        tracks,
        long,
    }
}

/// Configure first so the loop never plans with the default config
async fn start_dj(
    lib: &Library,
    segments_buff: usize,
    config: DjConfig,
) -> (Arc<AutoDj>, CancellationToken) {
    let dj = Arc::new(AutoDj::new(
        lib.store.clone(),
        lib.bus.clone(),
        DjSettings {
            time_delay: TimeDelta::seconds(1),
            segments_buff,
        },
    ));
    dj.set_config(config).await.unwrap();
    let cancel = CancellationToken::new();
    {
        let dj = Arc::clone(&dj);
        let cancel = cancel.clone();
        tokio::spawn(async move { dj.run(cancel).await });
    }
    (dj, cancel)
}

fn reservation(media_id: i64, start: DateTime<Utc>, secs: i64) -> Segment {
    Segment {
        id: 0,
        media_id,
        start,
        begin_cut: TimeDelta::zero(),
        stop_cut: TimeDelta::seconds(secs),
        protected: true,
        live_id: NO_LIVE,
    }
}

fn assert_no_overlaps(schedule: &[Segment]) {
    for pair in schedule.windows(2) {
        assert!(
            pair[0].end() <= pair[1].start,
            "segment {} overlaps segment {}",
            pair[0].id,
            pair[1].id
        );
    }
}

fn assert_contiguous(schedule: &[Segment]) {
    for pair in schedule.windows(2) {
        assert_eq!(
            pair[0].end(),
            pair[1].start,
            "gap or overlap between segments {} and {}",
            pair[0].id,
            pair[1].id
        );
    }
}

#[tokio::test]
async fn test_fills_the_timeline_without_gaps() {
    let lib = library().await;
    let (dj, cancel) = start_dj(
        &lib,
        5,
        DjConfig {
            tags: vec![lib.tag],
            stub: Stub::default(),
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(dj.is_playing());

    let now = Utc::now();
    let schedule = lib
        .store
        .schedule_cut(now, now + TimeDelta::seconds(60))
        .await
        .unwrap();
    assert!(schedule.len() >= 5, "only {} segments", schedule.len());
    assert_contiguous(&schedule);
    for s in &schedule {
        assert!(lib.tracks.contains(&s.media_id));
        assert!(!s.protected);
    }
    // Consecutive picks never repeat a track
    for pair in schedule.windows(2) {
        assert_ne!(pair[0].media_id, pair[1].media_id);
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_defers_to_reservations() {
    let lib = library().await;
    let now = Utc::now();
    let reserved_start = (now + TimeDelta::seconds(30)).trunc_subsecs(6);
    lib.store
        .save_segment(&reservation(lib.long, reserved_start, 10))
        .await
        .unwrap();
    let reserved_end = reserved_start + TimeDelta::seconds(10);

    let (_dj, cancel) = start_dj(
        &lib,
        14,
        DjConfig {
            tags: vec![lib.tag],
            stub: Stub::default(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let schedule = lib.store.schedule_from(Utc::now()).await.unwrap();
    assert_no_overlaps(&schedule);
    let mut after = 0;
    for s in schedule.iter().filter(|s| !s.protected) {
        assert!(
            s.end() <= reserved_start || s.start >= reserved_end,
            "segment {} [{} - {}] crosses the reservation",
            s.id,
            s.start,
            s.end()
        );
        if s.start >= reserved_end {
            after += 1;
        }
    }
    assert!(after > 0, "nothing was placed after the reservation");
    // Truncation keeps the air time in front of the reservation filled
    assert!(schedule
        .iter()
        .any(|s| !s.protected && s.end() == reserved_start));

    cancel.cancel();
}

#[tokio::test]
async fn test_replans_around_a_new_reservation() {
    let lib = library().await;
    let (_dj, cancel) = start_dj(
        &lib,
        8,
        DjConfig {
            tags: vec![lib.tag],
            stub: Stub::default(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let reserved_start = (Utc::now() + TimeDelta::milliseconds(8_500)).trunc_subsecs(6);
    lib.store
        .save_segment(&reservation(lib.long, reserved_start, 4))
        .await
        .unwrap();
    lib.bus.publish();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let schedule = lib.store.schedule_from(Utc::now()).await.unwrap();
    assert_contiguous(&schedule);
    assert!(schedule.iter().any(|s| s.protected && s.start == reserved_start));
    assert!(schedule
        .iter()
        .any(|s| !s.protected && s.start >= reserved_start + TimeDelta::seconds(4)));

    cancel.cancel();
}

#[tokio::test]
async fn test_short_queue_refills_around_a_reservation() {
    let lib = library().await;
    let (_dj, cancel) = start_dj(
        &lib,
        2,
        DjConfig {
            tags: vec![lib.tag],
            stub: Stub::default(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let queued: Vec<Segment> = lib.store.schedule_from(Utc::now()).await.unwrap();
    assert_eq!(queued.len(), 2);
    let displaced = queued[1].clone();

    // Reserve one second inside the second queued track
    let reserved_start = displaced.start + TimeDelta::milliseconds(500);
    lib.store
        .save_segment(&reservation(lib.long, reserved_start, 1))
        .await
        .unwrap();
    lib.bus.publish();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let schedule = lib.store.schedule_from(Utc::now()).await.unwrap();
    assert_contiguous(&schedule);
    assert_eq!(schedule[0].id, queued[0].id);
    let refill = schedule
        .iter()
        .find(|s| !s.protected && s.end() == reserved_start)
        .expect("gap before the reservation should be filled");
    assert_eq!(refill.start, displaced.start);
    // The displaced track keeps its place in the rotation
    assert_eq!(refill.media_id, displaced.media_id);
    for s in schedule.iter().filter(|s| !s.protected) {
        assert!(!s.overlaps(reserved_start, reserved_start + TimeDelta::seconds(1)));
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_stub_fills_short_gaps() {
    let lib = library().await;
    let stub = add_media(&lib.store, "jingle", 2, &[]).await;
    let reserved_start = (Utc::now() + TimeDelta::seconds(9)).trunc_subsecs(6);
    lib.store
        .save_segment(&reservation(lib.long, reserved_start, 5))
        .await
        .unwrap();

    let (_dj, cancel) = start_dj(
        &lib,
        10,
        DjConfig {
            tags: vec![lib.tag],
            stub: Stub {
                threshold: TimeDelta::seconds(60),
                media_id: stub,
            },
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let schedule = lib.store.schedule_from(Utc::now()).await.unwrap();
    assert_contiguous(&schedule);
    let before: Vec<&Segment> = schedule
        .iter()
        .filter(|s| !s.protected && s.end() <= reserved_start)
        .collect();
    assert!(!before.is_empty());
    assert!(before.iter().all(|s| s.media_id == stub));
    assert!(before.iter().all(|s| s.duration() <= TimeDelta::seconds(2)));

    cancel.cancel();
}

#[tokio::test]
async fn test_config_and_lifecycle() {
    let lib = library().await;
    let dj = AutoDj::new(
        lib.store.clone(),
        lib.bus.clone(),
        DjSettings {
            time_delay: TimeDelta::seconds(1),
            segments_buff: 2,
        },
    );

    let negative = DjConfig {
        tags: vec![],
        stub: Stub {
            threshold: TimeDelta::seconds(-1),
            media_id: 0,
        },
    };
    assert!(matches!(dj.set_config(negative).await, Err(Error::InvalidInput(_))));
    let missing = DjConfig {
        tags: vec![],
        stub: Stub {
            threshold: TimeDelta::seconds(1),
            media_id: 999,
        },
    };
    assert!(matches!(dj.set_config(missing).await, Err(Error::MediaNotFound)));
    assert_eq!(dj.config(), DjConfig::default());

    let dj = Arc::new(dj);
    let cancel = CancellationToken::new();
    let task = {
        let dj = Arc::clone(&dj);
        let cancel = cancel.clone();
        tokio::spawn(async move { dj.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(dj.is_playing());

    // A second run returns at once
    tokio::time::timeout(Duration::from_secs(1), dj.run(cancel.clone()))
        .await
        .expect("second run should not block");

    dj.stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("autodj should stop")
        .unwrap();
    assert!(!dj.is_playing());
}
