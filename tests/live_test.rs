use chrono::{TimeDelta, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use radio_dash::autodj::{AutoDj, DjConfig, DjSettings};
use radio_dash::bus::ChangeBus;
use radio_dash::live::{LiveController, LiveRequest, LiveSettings};
use radio_dash::model::{Media, Segment, NO_LIVE, NO_MEDIA};
use radio_dash::store::Store;

fn settings(content_dir: PathBuf, step_ms: i64, delay_ms: i64) -> LiveSettings {
    LiveSettings {
        program: None,
        args: Vec::new(),
        step: TimeDelta::milliseconds(step_ms),
        delay: TimeDelta::milliseconds(delay_ms),
        wait_before_delete: TimeDelta::seconds(60),
        stop_timeout: Duration::from_secs(2),
        chunk_length: TimeDelta::seconds(2),
        content_dir,
    }
}

async fn wait_until_idle(live: &LiveController) {
    for _ in 0..100 {
        if !live.is_playing() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("live did not stop");
}

async fn add_media(store: &Store) -> i64 {
    store
        .new_media(&Media {
            id: 0,
            name: "track".to_string(),
            author: String::new(),
            duration: TimeDelta::seconds(60),
            source_id: "track".to_string(),
            tags: BTreeSet::new(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_live_preempts_autodj_segments() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let bus = ChangeBus::new();
    let mut changes = bus.subscribe();
    let media_id = add_media(&store).await;

    let now = Utc::now();
    for offset in [4, 8] {
        store
            .save_segment(&Segment {
                id: 0,
                media_id,
                start: now + TimeDelta::seconds(offset),
                begin_cut: TimeDelta::zero(),
                stop_cut: TimeDelta::seconds(4),
                protected: false,
                live_id: NO_LIVE,
            })
            .await
            .unwrap();
    }

    let live = Arc::new(LiveController::new(
        store.clone(),
        bus.clone(),
        settings(dir.path().to_path_buf(), 10_000, 5_000),
    ));
    let cancel = CancellationToken::new();
    let info = live
        .start(
            LiveRequest {
                name: "L".to_string(),
                start: Some(now + TimeDelta::seconds(5)),
            },
            cancel.clone(),
        )
        .await
        .unwrap()
        .expect("live should start");

    assert!(live.is_playing());
    assert!(changes.recv().await);
    assert!(info.segment.protected);
    assert_ne!(info.segment.live_id, 0);
    assert_eq!(info.segment.media_id, NO_MEDIA);
    assert!(info.live.start >= now + TimeDelta::seconds(5) - TimeDelta::microseconds(1));
    assert!(info.live.offset >= TimeDelta::seconds(5) - TimeDelta::milliseconds(100));

    let schedule = store.schedule_from(now).await.unwrap();
    assert_eq!(schedule.len(), 1, "library segments should be displaced");
    assert_eq!(schedule[0].id, info.segment.id);

    let lives = store.lives(now).await.unwrap();
    assert_eq!(lives.len(), 1);
    assert_eq!(lives[0].name, "L");
    assert_eq!(lives[0].stop, None);

    // Only one live at a time
    let second = live
        .start(
            LiveRequest {
                name: "other".to_string(),
                start: None,
            },
            cancel.clone(),
        )
        .await
        .unwrap();
    assert!(second.is_none());

    // Stopped before it went on air: the reservation disappears
    live.stop();
    wait_until_idle(&live).await;
    assert!(live.info().is_none());
    assert!(store.schedule_from(now).await.unwrap().is_empty());
    assert!(store.live(info.live.id).await.unwrap().stop.is_some());
}

#[tokio::test]
async fn test_autodj_refills_around_a_live() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let bus = ChangeBus::new();
    for _ in 0..3 {
        add_media(&store).await;
    }

    let dj = Arc::new(AutoDj::new(
        store.clone(),
        bus.clone(),
        DjSettings {
            time_delay: TimeDelta::seconds(1),
            segments_buff: 3,
        },
    ));
    dj.set_config(DjConfig::default()).await.unwrap();
    let cancel = CancellationToken::new();
    {
        let dj = Arc::clone(&dj);
        let cancel = cancel.clone();
        tokio::spawn(async move { dj.run(cancel).await });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!store.schedule_from(Utc::now()).await.unwrap().is_empty());

    let live = Arc::new(LiveController::new(
        store.clone(),
        bus.clone(),
        settings(dir.path().to_path_buf(), 10_000, 0),
    ));
    let info = live
        .start(
            LiveRequest {
                name: "preempt".to_string(),
                start: Some(Utc::now() + TimeDelta::milliseconds(2_500)),
            },
            cancel.clone(),
        )
        .await
        .unwrap()
        .expect("live should start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let schedule = store.schedule_from(Utc::now()).await.unwrap();
    for pair in schedule.windows(2) {
        assert_eq!(pair[0].end(), pair[1].start, "hole after segment {}", pair[0].id);
    }
    let reserved = &info.segment;
    assert!(schedule.iter().any(|s| s.id == reserved.id));
    for s in schedule.iter().filter(|s| !s.protected) {
        assert!(!s.overlaps(reserved.start, reserved.end()));
    }
    assert!(schedule.iter().any(|s| !s.protected && s.end() == reserved.start));
    assert!(schedule.iter().any(|s| !s.protected && s.start == reserved.end()));

    live.stop();
    wait_until_idle(&live).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_live_segment_grows_then_is_cut_at_stop() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let live = Arc::new(LiveController::new(
        store.clone(),
        ChangeBus::new(),
        settings(dir.path().to_path_buf(), 500, 0),
    ));

    let info = live
        .start(
            LiveRequest {
                name: "growing".to_string(),
                start: None,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.segment.duration(), TimeDelta::milliseconds(500));

    tokio::time::sleep(Duration::from_millis(1300)).await;
    let grown = store.segment(info.segment.id).await.unwrap();
    assert!(grown.duration() >= TimeDelta::milliseconds(1500), "{:?}", grown.duration());
    assert_eq!(live.info().unwrap().segment.id, info.segment.id);

    live.stop();
    wait_until_idle(&live).await;
    let cut = store.segment(info.segment.id).await.unwrap();
    assert!(cut.duration() >= TimeDelta::milliseconds(1300));
    assert!(cut.duration() < TimeDelta::milliseconds(1500 + 2_000));
    let stopped_at = store.live(info.live.id).await.unwrap().stop.expect("stop recorded");
    assert!(stopped_at >= cut.end() - TimeDelta::milliseconds(1));
}

#[tokio::test]
async fn test_cancel_finalizes_live() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let live = Arc::new(LiveController::new(
        store.clone(),
        ChangeBus::new(),
        settings(dir.path().to_path_buf(), 10_000, 0),
    ));
    let cancel = CancellationToken::new();
    let info = live
        .start(
            LiveRequest {
                name: "cancelled".to_string(),
                start: None,
            },
            cancel.clone(),
        )
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    wait_until_idle(&live).await;
    assert!(store.live(info.live.id).await.unwrap().stop.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_capture_process_gets_output_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let mut s = settings(dir.path().to_path_buf(), 10_000, 0);
    s.program = Some("sh".to_string());
    s.args = vec![
        "-c".to_string(),
        r#"echo "$LIVE_SEGMENT_DURATION $LIVE_SAMPLING_RATE" > "$LIVE_OUTPUT_DIR/$LIVE_INIT_NAME"; exec sleep 30"#
            .to_string(),
    ];
    let live = Arc::new(LiveController::new(store.clone(), ChangeBus::new(), s));

    let info = live
        .start(
            LiveRequest {
                name: "capture".to_string(),
                start: None,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();

    let init = dir
        .path()
        .join(info.segment.id.to_string())
        .join("init.m4s");
    let mut written = String::new();
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(&init) {
            if !text.is_empty() {
                written = text;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(written.trim(), "2.000 44100");

    // SIGTERM ends the capture well before its sleep would
    let stopped = std::time::Instant::now();
    live.stop();
    wait_until_idle(&live).await;
    assert!(stopped.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_rejected_live_leaves_no_open_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let before = Utc::now() - TimeDelta::hours(1);
    let controller = || {
        Arc::new(LiveController::new(
            store.clone(),
            ChangeBus::new(),
            settings(dir.path().to_path_buf(), 10_000, 0),
        ))
    };
    let first = controller();
    let second = controller();
    let cancel = CancellationToken::new();

    let info = first
        .start(
            LiveRequest {
                name: "first".to_string(),
                start: None,
            },
            cancel.clone(),
        )
        .await
        .unwrap()
        .expect("first live should start");

    // Another controller on the same store collides with the live segment
    let rejected = second
        .start(
            LiveRequest {
                name: "second".to_string(),
                start: None,
            },
            cancel.clone(),
        )
        .await
        .unwrap();
    assert!(rejected.is_none());
    assert!(!second.is_playing());

    let open = store.lives(Utc::now()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, info.live.id);
    let closed = store.lives(before).await.unwrap();
    let other = closed
        .iter()
        .find(|l| l.name == "second")
        .expect("second live is recorded");
    assert!(other.stop.is_some());
    assert_eq!(store.schedule_from(before).await.unwrap().len(), 1);

    cancel.cancel();
    wait_until_idle(&first).await;
}
