//! AutoDJ: keeps unprotected time filled with shuffled library media.
//!
//! The run loop emits segments ahead of playout at `horizon`, steps over
//! protected reservations, truncates (or substitutes the stub) in front of
//! them, and re-plans when the timeline changes under it.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bus::{slot, ChangeBus, Listener, Notifier};
use crate::error::{Error, Result};
use crate::model::{micros, to_std, Media, Segment, NO_LIVE, NO_MEDIA};
use crate::store::Store;

/// Attempts to place one segment before giving up for this tick
const MAX_ATTEMPTS: usize = 4;

/// Shortest wait between two catch-up checks
const MIN_WAIT: Duration = Duration::from_millis(50);

/// Filler used in front of a reservation when the gap is at most `threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stub {
    #[serde(with = "micros")]
    pub threshold: TimeDelta,
    pub media_id: i64,
}

impl Default for Stub {
    fn default() -> Self {
        Self {
            threshold: TimeDelta::zero(),
            media_id: NO_MEDIA,
        }
    }
}

/// Runtime-mutable AutoDJ configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DjConfig {
    /// Candidate media carry any of these tags; empty selects the whole library
    #[serde(default)]
    pub tags: Vec<i64>,
    #[serde(default)]
    pub stub: Stub,
}

#[derive(Debug, Clone)]
pub struct DjSettings {
    /// Publication margin between `now` and the first emitted segment
    pub time_delay: TimeDelta,
    /// Segments kept queued ahead of playout
    pub segments_buff: usize,
}

struct DjEvents {
    config: Listener,
    library: Listener,
    stop: Listener,
    schedule: Listener,
}

impl DjEvents {
    fn drain(&mut self) {
        self.config.drain();
        self.library.drain();
        self.stop.drain();
        self.schedule.drain();
    }
}

enum Flow {
    Ready,
    Restart,
    Exit,
}

pub struct AutoDj {
    store: Store,
    bus: ChangeBus,
    settings: DjSettings,
    config: Mutex<DjConfig>,
    config_tx: Notifier,
    library_tx: Notifier,
    stop_tx: Notifier,
    /// Held for the whole run; doubles as the single-instance lock
    events: tokio::sync::Mutex<DjEvents>,
}

impl AutoDj {
    pub fn new(store: Store, bus: ChangeBus, settings: DjSettings) -> Self {
        let (config_tx, config) = slot();
        let (library_tx, library) = slot();
        let (stop_tx, stop) = slot();
        let schedule = bus.subscribe();
        Self {
            store,
            bus,
            settings,
            config: Mutex::new(DjConfig::default()),
            config_tx,
            library_tx,
            stop_tx,
            events: tokio::sync::Mutex::new(DjEvents {
                config,
                library,
                stop,
                schedule,
            }),
        }
    }

    pub fn config(&self) -> DjConfig {
        self.config.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Replace the configuration; a running loop restarts with it
    pub async fn set_config(&self, config: DjConfig) -> Result<()> {
        if config.stub.threshold < TimeDelta::zero() {
            return Err(Error::InvalidInput("stub threshold must not be negative".to_string()));
        }
        if config.stub.media_id != NO_MEDIA {
            self.store.media(config.stub.media_id).await?;
        }
        match self.config.lock() {
            Ok(mut current) => *current = config,
            Err(_) => return Err(Error::Internal("autodj config lock poisoned".to_string())),
        }
        self.config_tx.notify();
        Ok(())
    }

    /// The library changed; a running loop reloads and reshuffles
    pub fn library_changed(&self) {
        self.library_tx.notify();
    }

    pub fn stop(&self) {
        self.stop_tx.notify();
    }

    pub fn is_playing(&self) -> bool {
        self.events.try_lock().is_err()
    }

    /// Run until stopped or cancelled. Returns at once if already running.
    pub async fn run(&self, cancel: CancellationToken) {
        let Ok(mut guard) = self.events.try_lock() else {
            debug!("AutoDJ is already running");
            return;
        };
        let events = &mut *guard;
        events.drain();
        info!("AutoDJ started");

        'restart: loop {
            let config = self.config();
            let edge = Utc::now() + self.settings.time_delay;
            match self.store.clear_unprotected(edge).await {
                Ok(removed) if removed > 0 => {
                    debug!("Cleared {} unprotected segments from {}", removed, edge);
                    self.bus.publish_except(&events.schedule);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to clear unprotected segments: {}", e),
            }

            let mut planner = match Planner::load(&self.store, &self.settings, &config).await {
                Ok(planner) => planner,
                Err(e) => {
                    error!("AutoDJ failed to load the library: {}", e);
                    match self.idle(events, &cancel, to_std(self.settings.time_delay)).await {
                        Flow::Exit => break 'restart,
                        _ => continue 'restart,
                    }
                }
            };

            match self.catch_up(events, &cancel).await {
                Flow::Exit => break 'restart,
                Flow::Restart => continue 'restart,
                Flow::Ready => {}
            }

            let now = Utc::now();
            planner.horizon = now + self.settings.time_delay;
            if let Err(e) = planner.refresh_protected(now).await {
                warn!("Failed to read reservations: {}", e);
            }
            if planner.fill().await {
                self.bus.publish_except(&events.schedule);
            }

            let timer = tokio::time::sleep(planner.next_timer());
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'restart,
                    _ = events.stop.recv() => break 'restart,
                    _ = events.config.recv() => {
                        info!("AutoDJ configuration changed, restarting");
                        continue 'restart;
                    }
                    _ = events.schedule.recv() => {
                        match planner.resolve().await {
                            Ok(true) => self.bus.publish_except(&events.schedule),
                            Ok(false) => {}
                            Err(e) => warn!("AutoDJ failed to re-plan: {}", e),
                        }
                    }
                    _ = events.library.recv() => {
                        if let Err(e) = planner.reload_library(&config.tags).await {
                            warn!("AutoDJ failed to reload the library: {}", e);
                        } else if planner.fill().await {
                            self.bus.publish_except(&events.schedule);
                        }
                    }
                    _ = &mut timer => {
                        planner.pending.pop_front();
                        if planner.fill().await {
                            self.bus.publish_except(&events.schedule);
                        }
                        timer.as_mut().reset(tokio::time::Instant::now() + planner.next_timer());
                    }
                }
            }
        }

        info!("AutoDJ stopped");
    }

    /// Wait until nothing is playing at the publication edge
    async fn catch_up(&self, events: &mut DjEvents, cancel: &CancellationToken) -> Flow {
        loop {
            let now = Utc::now();
            let edge = now + self.settings.time_delay;
            let playing = match self.store.schedule_cut(edge, edge).await {
                Ok(segments) => segments.into_iter().find(|s| s.plays_at(edge)),
                Err(e) => {
                    warn!("AutoDJ failed to read the schedule: {}", e);
                    None
                }
            };
            let Some(segment) = playing else {
                return Flow::Ready;
            };

            let wait = to_std(segment.end() - edge).max(MIN_WAIT);
            debug!(
                "Segment {} is on air, AutoDJ waits {:.1}s",
                segment.id,
                wait.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Flow::Exit,
                _ = events.stop.recv() => return Flow::Exit,
                _ = events.config.recv() => return Flow::Restart,
                _ = events.schedule.recv() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn idle(&self, events: &mut DjEvents, cancel: &CancellationToken, wait: Duration) -> Flow {
        tokio::select! {
            _ = cancel.cancelled() => Flow::Exit,
            _ = events.stop.recv() => Flow::Exit,
            _ = events.config.recv() => Flow::Restart,
            _ = events.library.recv() => Flow::Restart,
            _ = tokio::time::sleep(wait) => Flow::Restart,
        }
    }
}

/// A segment this run placed and still counts as queued
#[derive(Debug, Clone)]
struct Placed {
    id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    /// How far the horizon moved when it was placed
    advance: TimeDelta,
    /// Consumed a rotation slot (the stub does not)
    from_library: bool,
}

/// Library rotation and placement state, owned by one run of the loop
struct Planner {
    store: Store,
    settings: DjSettings,
    library: Vec<Media>,
    order: Vec<usize>,
    cursor: usize,
    stub: Option<Media>,
    threshold: TimeDelta,
    /// Reservations from now on, by start
    protected: Vec<Segment>,
    /// Next insertion point
    horizon: DateTime<Utc>,
    /// Queued segments, oldest first
    pending: VecDeque<Placed>,
}

impl Planner {
    async fn load(store: &Store, settings: &DjSettings, config: &DjConfig) -> Result<Planner> {
        let stub = if config.stub.media_id != NO_MEDIA {
            match store.media(config.stub.media_id).await {
                Ok(m) => Some(m),
                Err(e) if e.is_not_found() => {
                    warn!("Stub media {} is gone, playing without stub", config.stub.media_id);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let mut planner = Planner {
            store: store.clone(),
            settings: settings.clone(),
            library: Vec::new(),
            order: Vec::new(),
            cursor: 0,
            stub,
            threshold: config.stub.threshold,
            protected: Vec::new(),
            horizon: Utc::now() + settings.time_delay,
            pending: VecDeque::new(),
        };
        planner.reload_library(&config.tags).await?;
        Ok(planner)
    }

    async fn reload_library(&mut self, tags: &[i64]) -> Result<()> {
        let last = self.last_id();
        self.library = self.store.media_by_tags(tags).await?;
        if self.library.is_empty() {
            warn!("AutoDJ library is empty for tags {:?}", tags);
        } else {
            info!("AutoDJ library: {} media", self.library.len());
        }
        self.order = (0..self.library.len()).collect();
        self.cursor = 0;
        self.shuffle(last);
        Ok(())
    }

    /// Media id at the end of the current rotation
    fn last_id(&self) -> Option<i64> {
        self.order.last().and_then(|&i| self.library.get(i)).map(|m| m.id)
    }

    /// Uniform permutation whose first entry differs from `previous_last`
    fn shuffle(&mut self, previous_last: Option<i64>) {
        let mut rng = rand::thread_rng();
        self.order.shuffle(&mut rng);
        if self.order.len() > 1 {
            while Some(self.library[self.order[0]].id) == previous_last {
                self.order.shuffle(&mut rng);
            }
        }
    }

    fn peek(&self) -> Option<&Media> {
        self.order.get(self.cursor).and_then(|&i| self.library.get(i))
    }

    fn advance(&mut self) {
        if self.order.is_empty() {
            return;
        }
        self.cursor += 1;
        if self.cursor == self.order.len() {
            let last = self.last_id();
            self.shuffle(last);
            self.cursor = 0;
        }
    }

    fn rewind(&mut self, count: usize) {
        let len = self.order.len();
        if len > 0 {
            self.cursor = (self.cursor + len - count % len) % len;
        }
    }

    async fn refresh_protected(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.protected = self
            .store
            .schedule_from(now)
            .await?
            .into_iter()
            .filter(|s| s.protected)
            .collect();
        Ok(())
    }

    fn next_timer(&self) -> Duration {
        to_std(
            self.pending
                .front()
                .map(|p| p.advance)
                .unwrap_or(self.settings.time_delay),
        )
        .max(MIN_WAIT)
    }

    /// Top the queue up to `segments_buff`; true when anything was placed
    async fn fill(&mut self) -> bool {
        let mut placed = false;
        while self.pending.len() < self.settings.segments_buff {
            match self.emit().await {
                Ok(Some(segment)) => {
                    self.pending.push_back(segment);
                    placed = true;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("AutoDJ skipped a segment: {}", e);
                    break;
                }
            }
        }
        placed
    }

    /// Place one segment at the horizon
    async fn emit(&mut self) -> Result<Option<Placed>> {
        let now = Utc::now();
        if self.horizon < now {
            warn!(
                "AutoDJ fell {}ms behind, resuming now",
                (now - self.horizon).num_milliseconds()
            );
            self.horizon = now;
        }
        let from = self.horizon;

        for _ in 0..MAX_ATTEMPTS {
            for p in &self.protected {
                if p.plays_at(self.horizon) {
                    self.horizon = p.end();
                }
            }
            let Some(media) = self.peek().cloned() else {
                return Ok(None);
            };

            let next_reserved = self
                .protected
                .iter()
                .map(|p| p.start)
                .find(|start| *start > self.horizon);
            let (chosen, stop_cut, from_library) = match next_reserved {
                Some(limit) if limit - self.horizon < media.duration => {
                    let gap = limit - self.horizon;
                    match &self.stub {
                        Some(stub) if gap <= self.threshold => {
                            (stub.clone(), stub.duration.min(gap), false)
                        }
                        _ => (media, gap, true),
                    }
                }
                _ => {
                    let duration = media.duration;
                    (media, duration, true)
                }
            };

            let segment = Segment {
                id: 0,
                media_id: chosen.id,
                start: self.horizon,
                begin_cut: TimeDelta::zero(),
                stop_cut,
                protected: false,
                live_id: NO_LIVE,
            };
            match self.store.save_segment(&segment).await {
                Ok(id) => {
                    debug!(
                        "AutoDJ placed '{}' as segment {} at {} for {}ms",
                        chosen.name,
                        id,
                        segment.start,
                        stop_cut.num_milliseconds()
                    );
                    if from_library {
                        self.advance();
                    }
                    self.horizon = segment.end();
                    return Ok(Some(Placed {
                        id,
                        start: segment.start,
                        end: segment.end(),
                        advance: self.horizon - from,
                        from_library,
                    }));
                }
                Err(Error::SegmentIntersection) => {
                    let blockers = self.store.schedule_cut(segment.start, segment.end()).await?;
                    if let Some(end) = blockers
                        .iter()
                        .filter(|b| b.overlaps(segment.start, segment.end()))
                        .map(|b| b.end())
                        .max()
                    {
                        self.horizon = self.horizon.max(end);
                    }
                    self.refresh_protected(now).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Re-plan after a timeline change. Everything after the first hole
    /// before the horizon is cleared and re-emitted in rotation order, and
    /// queued segments a reservation displaced are given back to the rotation.
    async fn resolve(&mut self) -> Result<bool> {
        let now = Utc::now();
        let schedule = self.store.schedule_from(now).await?;
        self.protected = schedule.iter().filter(|s| s.protected).cloned().collect();
        let present: HashSet<i64> = schedule.iter().map(|s| s.id).collect();

        let floor = now + self.settings.time_delay;
        let mut reach = floor;
        let mut hole = None;
        for segment in schedule.iter().filter(|s| s.end() > floor) {
            if segment.start > reach {
                hole = Some(reach);
                break;
            }
            reach = reach.max(segment.end());
        }
        let hole = match hole {
            Some(at) => Some(at),
            None if reach < self.horizon => Some(reach),
            None => None,
        }
        .filter(|at| *at < self.horizon);

        if let Some(at) = hole {
            let cleared = self.store.clear_unprotected(at).await?;
            debug!("AutoDJ cleared {} segments from {}", cleared, at);
        }

        let lost: Vec<bool> = self
            .pending
            .iter()
            .map(|p| {
                p.end > now && (!present.contains(&p.id) || hole.is_some_and(|at| p.start >= at))
            })
            .collect();
        if hole.is_none() && !lost.contains(&true) {
            return Ok(false);
        }

        // Only a lost tail can be replayed in order; a segment lost in the
        // middle of the queue had its air time taken by a reservation.
        let tail = lost.iter().rev().take_while(|l| **l).count();
        let replay = self
            .pending
            .iter()
            .skip(self.pending.len() - tail)
            .filter(|p| p.from_library)
            .count();
        let mut flags = lost.iter();
        self.pending.retain(|_| !flags.next().copied().unwrap_or(false));

        info!(
            "AutoDJ re-plans from {} ({} queued segments lost, {} replayed)",
            hole.unwrap_or(self.horizon),
            lost.iter().filter(|l| **l).count(),
            replay
        );
        if let Some(at) = hole {
            self.horizon = at;
        }
        self.rewind(replay);
        self.fill().await;
        Ok(true)
    }
}
