//! DASH pipeline: keeps the manifest and segment artifacts in step with the
//! timeline window `[now, now + horizon]`.

use chrono::{TimeDelta, Utc};
use log::{error, info};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{slot, Listener, Notifier};
use crate::manifest::ManifestBuilder;
use crate::model::to_std;
use crate::producer::SegmentProducer;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub horizon: TimeDelta,
    pub update_freq: TimeDelta,
    /// Artifacts of segments that ended less than this ago are kept
    pub retain_after_end: TimeDelta,
}

pub struct DashPipeline {
    store: Store,
    manifest: ManifestBuilder,
    producer: SegmentProducer,
    settings: PipelineSettings,
    changes: Listener,
    stop_tx: Notifier,
    stop_rx: Listener,
}

impl DashPipeline {
    pub fn new(
        store: Store,
        manifest: ManifestBuilder,
        producer: SegmentProducer,
        settings: PipelineSettings,
        changes: Listener,
    ) -> Self {
        let (stop_tx, stop_rx) = slot();
        Self {
            store,
            manifest,
            producer,
            settings,
            changes,
            stop_tx,
            stop_rx,
        }
    }

    /// Handle that ends `run`
    pub fn stopper(&self) -> Notifier {
        self.stop_tx.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "DASH pipeline started, horizon {}s, update every {}s",
            self.settings.horizon.num_seconds(),
            self.settings.update_freq.num_seconds()
        );
        let mut changes_open = true;
        loop {
            self.refresh().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stop_rx.recv() => break,
                open = self.changes.recv(), if changes_open => {
                    changes_open = open;
                }
                _ = tokio::time::sleep(to_std(self.settings.update_freq)) => {}
            }
        }

        self.clean_up().await;
        info!("DASH pipeline stopped");
    }

    /// One pass: cut the window, publish the manifest, produce and prune artifacts
    pub async fn refresh(&mut self) {
        let now = Utc::now();
        let window = match self.store.schedule_cut(now, now + self.settings.horizon).await {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to read the schedule window: {}", e);
                return;
            }
        };

        self.manifest.set_schedule(&window, now);
        if let Err(e) = self.manifest.dump().await {
            error!("Failed to write manifest: {}", e);
        }

        for segment in &window {
            self.producer.generate(segment).await;
        }

        let mut keep: HashSet<i64> = window.iter().map(|s| s.id).collect();
        match self
            .store
            .schedule_cut(now - self.settings.retain_after_end, now)
            .await
        {
            Ok(recent) => keep.extend(recent.iter().map(|s| s.id)),
            Err(e) => {
                error!("Failed to read recent segments, keeping all artifacts: {}", e);
                return;
            }
        }
        self.producer.retain(&keep).await;
    }

    async fn clean_up(&mut self) {
        if let Err(e) = self.manifest.clean_up().await {
            error!("Failed to remove manifest: {}", e);
        }
        self.producer.clean_up().await;
    }
}
