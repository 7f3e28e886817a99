//! Segment producer: one encoder run per scheduled segment.
//!
//! Output lands in `<content_dir>/<segment id>/` as `init.m4s` plus
//! `chunk-NNNNN.m4s`. Encoder failures are logged and the partial directory is
//! removed so the next pipeline pass retries it. A segment whose cuts changed
//! after encoding is encoded again; moving it in time keeps its artifacts.

use chrono::TimeDelta;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::constants::{BANDWIDTH, CHANNELS, CHUNK_TEMPLATE, CUT_NAME, INIT_NAME, SAMPLE_RATE};
use crate::model::{delta_micros, Segment};
use crate::source::SourceStore;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    /// Placed before the generated arguments
    pub args: Vec<String>,
    pub chunk_length: TimeDelta,
}

pub struct SegmentProducer {
    content_dir: PathBuf,
    encoder: EncoderSettings,
    store: Store,
    sources: SourceStore,
    in_flight: HashMap<i64, Encoding>,
}

struct Encoding {
    cut: String,
    handle: JoinHandle<()>,
}

/// Slice of the source a segment plays, as recorded in `CUT_NAME`
fn cut_key(segment: &Segment) -> String {
    format!("{} {}", delta_micros(segment.begin_cut), delta_micros(segment.stop_cut))
}

fn secs(d: TimeDelta) -> String {
    format!("{:.6}", d.num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
}

/// Arguments that turn a slice of `source` into DASH init and chunk files in `out_dir`
pub fn encoder_args(
    source: &Path,
    segment: &Segment,
    chunk_length: TimeDelta,
    out_dir: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-ss".into(),
        secs(segment.begin_cut),
        "-t".into(),
        secs(segment.duration()),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-map".into(),
        "0:a:0".into(),
        "-c:a".into(),
        "aac".into(),
        "-profile:a".into(),
        "aac_low".into(),
        "-b:a".into(),
        format!("{}k", BANDWIDTH / 1000),
        "-ar".into(),
        SAMPLE_RATE.to_string(),
        "-ac".into(),
        CHANNELS.to_string(),
        "-f".into(),
        "dash".into(),
        "-seg_duration".into(),
        secs(chunk_length),
        "-use_template".into(),
        "1".into(),
        "-use_timeline".into(),
        "0".into(),
        "-init_seg_name".into(),
        INIT_NAME.into(),
        "-media_seg_name".into(),
        CHUNK_TEMPLATE.into(),
    ];
    args.push(out_dir.join("encoder.mpd").to_string_lossy().into_owned());
    args
}

async fn run_encoder(program: String, args: Vec<String>, dir: PathBuf, segment_id: i64, cut: String) {
    let started = std::time::Instant::now();
    let output = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let failure = match output {
        Ok(out) if out.status.success() => None,
        Ok(out) => Some(format!(
            "{}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => Some(format!("failed to start '{}': {}", program, e)),
    };

    match failure {
        None => {
            debug!(
                "Segment {} encoded in {:.1}s",
                segment_id,
                started.elapsed().as_secs_f64()
            );
            if let Err(e) = tokio::fs::write(dir.join(CUT_NAME), cut).await {
                warn!("Failed to record cut of segment {}: {}", segment_id, e);
            }
        }
        Some(reason) => {
            error!("Encoder failed for segment {}: {}", segment_id, reason);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

impl SegmentProducer {
    pub fn new(
        content_dir: impl Into<PathBuf>,
        encoder: EncoderSettings,
        store: Store,
        sources: SourceStore,
    ) -> Self {
        Self {
            content_dir: content_dir.into(),
            encoder,
            store,
            sources,
            in_flight: HashMap::new(),
        }
    }

    pub fn segment_dir(&self, segment_id: i64) -> PathBuf {
        self.content_dir.join(segment_id.to_string())
    }

    /// Start encoding a segment unless artifacts for its current cuts exist
    /// or are in progress. Live segments are written by the capture process.
    pub async fn generate(&mut self, segment: &Segment) {
        if segment.is_live() {
            return;
        }
        let cut = cut_key(segment);
        let dir = self.segment_dir(segment.id);
        self.in_flight.retain(|_, e| !e.handle.is_finished());
        if let Some(running) = self.in_flight.get(&segment.id) {
            if running.cut == cut {
                return;
            }
            info!("Segment {} was re-cut while encoding, restarting", segment.id);
            running.handle.abort();
            self.in_flight.remove(&segment.id);
            self.discard(&dir).await;
        } else if tokio::fs::try_exists(dir.join(INIT_NAME)).await.unwrap_or(false) {
            let encoded = tokio::fs::read_to_string(dir.join(CUT_NAME)).await.unwrap_or_default();
            if encoded == cut {
                return;
            }
            info!("Segment {} was re-cut, encoding it again", segment.id);
            self.discard(&dir).await;
        }

        let media = match self.store.media(segment.media_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!("No source for segment {} (media {}): {}", segment.id, segment.media_id, e);
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Failed to create {}: {}", dir.display(), e);
            return;
        }

        let source = self.sources.path(&media.source_id);
        let mut args = self.encoder.args.clone();
        args.extend(encoder_args(&source, segment, self.encoder.chunk_length, &dir));

        info!("Encoding segment {} from '{}'", segment.id, media.name);
        let handle = tokio::spawn(run_encoder(
            self.encoder.program.clone(),
            args,
            dir,
            segment.id,
            cut.clone(),
        ));
        self.in_flight.insert(segment.id, Encoding { cut, handle });
    }

    async fn discard(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }

    /// Wait for every running encoder
    pub async fn join_all(&mut self) {
        for (_, running) in self.in_flight.drain() {
            let _ = running.handle.await;
        }
    }

    /// Remove segment directories that are not in `keep`
    pub async fn retain(&mut self, keep: &HashSet<i64>) {
        let mut entries = match tokio::fs::read_dir(&self.content_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {}", self.content_dir.display(), e);
                return;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list {}: {}", self.content_dir.display(), e);
                    break;
                }
            };
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) else {
                continue;
            };
            if keep.contains(&id) || !entry.path().is_dir() {
                continue;
            }
            if let Some(running) = self.in_flight.remove(&id) {
                running.handle.abort();
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => debug!("Removed artifacts of segment {}", id),
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }

    /// Stop all encoders and remove every segment directory
    pub async fn clean_up(&mut self) {
        for (_, running) in self.in_flight.drain() {
            running.handle.abort();
        }
        self.retain(&HashSet::new()).await;
    }
}
