//! Live controller: reserves a growing protected segment while an external
//! capture process writes DASH chunks for it.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::bus::{slot, ChangeBus, Listener, Notifier};
use crate::constants::{
    parse_chunk_name, BANDWIDTH, CHANNELS, CHUNK_TEMPLATE, INIT_NAME, SAMPLE_RATE,
};
use crate::error::{Error, Result};
use crate::model::{to_std, Live, Segment, NO_MEDIA};
use crate::store::{timed, Store};

#[derive(Debug, Clone)]
pub struct LiveSettings {
    /// Capture program; without one the reservation still runs
    pub program: Option<String>,
    pub args: Vec<String>,
    pub step: TimeDelta,
    pub delay: TimeDelta,
    pub wait_before_delete: TimeDelta,
    pub stop_timeout: Duration,
    pub chunk_length: TimeDelta,
    pub content_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveRequest {
    pub name: String,
    /// Requested start; `now + delay` at the earliest
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveInfo {
    pub live: Live,
    pub segment: Segment,
}

pub struct LiveController {
    store: Store,
    bus: ChangeBus,
    settings: LiveSettings,
    /// Stop slot, held by the running broadcast
    session: Arc<tokio::sync::Mutex<Listener>>,
    stop_tx: Notifier,
    current: Mutex<Option<LiveInfo>>,
}

impl LiveController {
    pub fn new(store: Store, bus: ChangeBus, settings: LiveSettings) -> Self {
        let (stop_tx, stop_rx) = slot();
        Self {
            store,
            bus,
            settings,
            session: Arc::new(tokio::sync::Mutex::new(stop_rx)),
            stop_tx,
            current: Mutex::new(None),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.session.try_lock().is_err()
    }

    pub fn info(&self) -> Option<LiveInfo> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    pub fn stop(&self) {
        self.stop_tx.notify();
    }

    fn set_current(&self, info: Option<LiveInfo>) {
        if let Ok(mut current) = self.current.lock() {
            *current = info;
        }
    }

    /// Begin a live broadcast. Returns `None` when one is already running or
    /// when the reservation could not be placed.
    pub async fn start(
        self: &Arc<Self>,
        request: LiveRequest,
        cancel: CancellationToken,
    ) -> Result<Option<LiveInfo>> {
        let Ok(mut session) = self.session.clone().try_lock_owned() else {
            debug!("Live is already running");
            return Ok(None);
        };
        session.drain();

        let now = Utc::now();
        let requested = request.start.unwrap_or(now);
        let (start, offset) = if self.settings.delay > requested - now {
            (now + self.settings.delay, self.settings.delay)
        } else {
            (requested, requested - now)
        };
        let mut live = Live {
            id: 0,
            name: request.name,
            start: start.trunc_subsecs(6),
            stop: None,
            delay: self.settings.delay,
            offset,
        };
        live.id = timed(self.store.new_live(&live)).await?;

        let mut segment = Segment {
            id: 0,
            media_id: NO_MEDIA,
            start: live.start,
            begin_cut: TimeDelta::zero(),
            stop_cut: self.settings.step,
            protected: true,
            live_id: live.id,
        };
        let placed = match timed(self.clear_space(&segment)).await {
            Ok(_) => timed(self.store.save_segment(&segment)).await,
            Err(e) => Err(e),
        };
        match placed {
            Ok(id) => segment.id = id,
            Err(e) => {
                live.stop = Some(now);
                if let Err(stop_err) = timed(self.store.set_live_stop(&live)).await {
                    warn!("Failed to close live {}: {}", live.id, stop_err);
                }
                return match e {
                    Error::SegmentIntersection => {
                        warn!("Live '{}' overlaps another live, not starting", live.name);
                        Ok(None)
                    }
                    e => Err(e),
                };
            }
        }
        self.bus.publish();

        info!(
            "Live '{}' ({}) reserved segment {} at {} (offset {}ms)",
            live.name,
            live.id,
            segment.id,
            live.start,
            live.offset.num_milliseconds()
        );
        let capture = self.spawn_capture(&live, &segment).await;
        let info = LiveInfo {
            live: live.clone(),
            segment: segment.clone(),
        };
        self.set_current(Some(info.clone()));

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller
                .broadcast(session, live, segment, capture, cancel)
                .await;
        });
        Ok(Some(info))
    }

    /// Delete editor reservations that overlap `segment`. Unprotected
    /// segments are displaced by the store itself.
    async fn clear_space(&self, segment: &Segment) -> Result<usize> {
        let mut removed = 0;
        for other in self.store.schedule_cut(segment.start, segment.end()).await? {
            if other.id == segment.id
                || other.is_live()
                || !other.protected
                || !other.overlaps(segment.start, segment.end())
            {
                continue;
            }
            match self.store.delete_segment(other.id).await {
                Ok(()) | Err(Error::SegmentNotFound) => {
                    info!("Live displaced reserved segment {}", other.id);
                    removed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    async fn spawn_capture(&self, live: &Live, segment: &Segment) -> Option<Child> {
        let program = self.settings.program.as_ref()?;
        let dir = self.settings.content_dir.join(segment.id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Failed to create {}: {}", dir.display(), e);
            return None;
        }
        let chunk_secs = self.settings.chunk_length.num_milliseconds() as f64 / 1000.0;
        let spawned = Command::new(program)
            .args(&self.settings.args)
            .env("LIVE_OUTPUT_DIR", &dir)
            .env("LIVE_INIT_NAME", INIT_NAME)
            .env("LIVE_CHUNK_NAME", CHUNK_TEMPLATE)
            .env("LIVE_BITRATE", BANDWIDTH.to_string())
            .env("LIVE_CHANNELS", CHANNELS.to_string())
            .env("LIVE_SAMPLING_RATE", SAMPLE_RATE.to_string())
            .env("LIVE_SEGMENT_DURATION", format!("{:.3}", chunk_secs))
            .env("LIVE_START", live.start.to_rfc3339())
            .env(
                "LIVE_OFFSET",
                format!("{:.3}", live.offset.num_milliseconds() as f64 / 1000.0),
            )
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                info!("Capture started (pid {:?}) into {}", child.id(), dir.display());
                Some(child)
            }
            Err(e) => {
                error!("Failed to start capture '{}': {}", program, e);
                None
            }
        }
    }

    async fn broadcast(
        &self,
        mut session: OwnedMutexGuard<Listener>,
        mut live: Live,
        mut segment: Segment,
        mut capture: Option<Child>,
        cancel: CancellationToken,
    ) {
        let step = to_std(self.settings.step);
        let mut extend = tokio::time::interval_at(tokio::time::Instant::now() + step, step);
        let mut sweep = tokio::time::interval(step);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = session.recv() => break,
                _ = extend.tick() => self.extend(&live, &mut segment).await,
                _ = sweep.tick() => self.sweep(&segment).await,
                status = wait_child(&mut capture) => {
                    match status {
                        Ok(status) => info!("Capture process exited: {}", status),
                        Err(e) => warn!("Failed to wait for capture process: {}", e),
                    }
                    capture = None;
                }
            }
        }

        self.finish(&mut live, &mut segment).await;
        if let Some(child) = capture {
            stop_capture(child, self.settings.stop_timeout).await;
        }
        self.set_current(None);
        info!("Live '{}' ({}) stopped", live.name, live.id);
        drop(session);
    }

    /// Grow the reservation by one step
    async fn extend(&self, live: &Live, segment: &mut Segment) {
        let mut grown = segment.clone();
        grown.stop_cut = segment.stop_cut + self.settings.step;
        if let Err(e) = self.clear_space(&grown).await {
            warn!("Failed to clear space for live {}: {}", live.id, e);
        }
        match self.store.update_segment_timing(&grown).await {
            Ok(()) => {
                *segment = grown;
                self.set_current(Some(LiveInfo {
                    live: live.clone(),
                    segment: segment.clone(),
                }));
                self.bus.publish();
                debug!(
                    "Live segment {} extended to {}s",
                    segment.id,
                    segment.duration().num_seconds()
                );
            }
            Err(e) => warn!("Failed to extend live segment {}: {}", segment.id, e),
        }
    }

    /// Remove chunks that went off air more than `wait_before_delete` ago
    async fn sweep(&self, segment: &Segment) {
        let dir = self.settings.content_dir.join(segment.id.to_string());
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return;
        };
        let cutoff = Utc::now() - self.settings.wait_before_delete;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(number) = entry.file_name().to_str().and_then(parse_chunk_name) else {
                continue;
            };
            let ends = segment.start + self.settings.chunk_length * number as i32;
            if ends < cutoff {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("Failed to remove {}: {}", entry.path().display(), e);
                }
            }
        }
    }

    /// Close the live record and cut the reservation at `now`
    async fn finish(&self, live: &mut Live, segment: &mut Segment) {
        let now = Utc::now();
        live.stop = Some(now);
        if let Err(e) = self.store.set_live_stop(live).await {
            error!("Failed to record stop of live {}: {}", live.id, e);
        }

        let result = if now > segment.start {
            segment.stop_cut = segment.begin_cut + (now - segment.start);
            self.store.update_segment_timing(segment).await
        } else {
            self.store.delete_segment(segment.id).await
        };
        if let Err(e) = result {
            error!("Failed to finalize live segment {}: {}", segment.id, e);
        }
        self.bus.publish();
    }
}

async fn wait_child(capture: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match capture {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    match Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("Failed to signal capture process {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
async fn terminate(_child: &Child) -> bool {
    false
}

/// SIGTERM, then SIGKILL once `timeout` passes
async fn stop_capture(mut child: Child, timeout: Duration) {
    let timeout = if terminate(&child).await {
        timeout
    } else {
        Duration::ZERO
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => info!("Capture process stopped: {}", status),
        Ok(Err(e)) => warn!("Failed to wait for capture process: {}", e),
        Err(_) => {
            warn!("Capture process did not stop in time, killing it");
            if let Err(e) = child.kill().await {
                error!("Failed to kill capture process: {}", e);
            }
        }
    }
}
