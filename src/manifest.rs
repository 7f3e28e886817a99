//! Dynamic DASH manifest for the broadcast timeline.
//!
//! One Period per scheduled segment. A Period's id is its position in the
//! window plus a `last_played_period` counter that only grows, so it keeps
//! its id across rebuilds until a segment is inserted in front of it.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use log::{debug, warn};
use std::path::PathBuf;

use crate::constants::{
    AUDIO_CHANNEL_SCHEME, AUDIO_CODEC, AUDIO_MIME, BANDWIDTH, CHANNELS, CHUNK_TEMPLATE,
    DASH_PROFILE, INIT_NAME, SAMPLE_RATE, UTC_TIMING_SCHEME,
};
use crate::model::Segment;

#[derive(Debug, Clone)]
pub struct ManifestSettings {
    /// Where `dump` writes the MPD
    pub path: PathBuf,
    pub chunk_length: TimeDelta,
    /// Advertised as `minBufferTime`
    pub buffer_time: TimeDelta,
    /// Advertised as `timeShiftBufferDepth`
    pub buffer_depth: TimeDelta,
    pub minimum_update_period: TimeDelta,
    pub utc_timing_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: u64,
    pub segment_id: i64,
    /// Wall-clock start of the first published chunk
    pub begins: DateTime<Utc>,
    /// Offset from `availabilityStartTime`
    pub start: TimeDelta,
    pub duration: TimeDelta,
    pub start_number: u64,
}

impl Period {
    pub fn ends(&self) -> DateTime<Utc> {
        self.begins + self.duration
    }
}

pub struct ManifestBuilder {
    settings: ManifestSettings,
    start_time: DateTime<Utc>,
    published: DateTime<Utc>,
    last_played_period: u64,
    periods: Vec<Period>,
}

/// `PT<seconds>.<millis>S`
pub fn iso_duration(d: TimeDelta) -> String {
    let ms = d.num_milliseconds().max(0);
    format!("PT{}.{:03}S", ms / 1000, ms % 1000)
}

/// UTC, second precision, no offset
pub fn iso_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl ManifestBuilder {
    /// The broadcast epoch is the current second
    pub fn new(settings: ManifestSettings) -> Self {
        Self::with_start_time(settings, Utc::now())
    }

    pub fn with_start_time(settings: ManifestSettings, start_time: DateTime<Utc>) -> Self {
        let start_time = start_time.trunc_subsecs(0);
        Self {
            settings,
            start_time,
            published: start_time,
            last_played_period: 0,
            periods: Vec::new(),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn last_played_period(&self) -> u64 {
        self.last_played_period
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    /// Rebuild the Period list from segments ordered by start
    pub fn set_schedule(&mut self, segments: &[Segment], now: DateTime<Utc>) {
        let played = self
            .periods
            .iter()
            .position(|p| p.begins <= now && now < p.ends())
            .or_else(|| self.periods.iter().position(|p| p.begins > now))
            .unwrap_or(self.periods.len());
        self.last_played_period += played as u64;

        let mut window: Vec<Segment> = segments.to_vec();
        for i in 1..window.len() {
            let (next_id, next_start) = (window[i].id, window[i].start);
            let prev = &mut window[i - 1];
            if prev.end() > next_start {
                warn!(
                    "Segment {} overlaps segment {} by {}ms, truncating",
                    prev.id,
                    next_id,
                    (prev.end() - next_start).num_milliseconds()
                );
                prev.stop_cut = prev.begin_cut + (next_start - prev.start).max(TimeDelta::zero());
            }
        }

        let chunk_us = self.settings.chunk_length.num_microseconds().unwrap_or(1).max(1);
        let mut periods = Vec::with_capacity(window.len());
        for segment in window.iter().filter(|s| s.duration() > TimeDelta::zero()) {
            // Chunks encoded before the epoch cannot be addressed; skip whole chunks.
            let skipped = if segment.start < self.start_time {
                let behind = (self.start_time - segment.start).num_microseconds().unwrap_or(0);
                ((behind + chunk_us - 1) / chunk_us) as u64
            } else {
                0
            };
            let clipped = TimeDelta::microseconds(skipped as i64 * chunk_us);
            if clipped >= segment.duration() {
                continue;
            }
            let begins = segment.start + clipped;
            periods.push(Period {
                id: periods.len() as u64 + 1 + self.last_played_period,
                segment_id: segment.id,
                begins,
                start: begins - self.start_time,
                duration: segment.duration() - clipped,
                start_number: skipped + 1,
            });
        }

        debug!(
            "Manifest rebuilt: {} periods, last played period {}",
            periods.len(),
            self.last_played_period
        );
        self.periods = periods;
        self.published = now;
    }

    fn render_period(&self, period: &Period) -> String {
        format!(
            r#"  <Period id="{id}" start="{start}" duration="{duration}">
    <AdaptationSet contentType="audio" segmentAlignment="true">
      <Representation id="audio" mimeType="{mime}" codecs="{codec}" bandwidth="{bandwidth}" audioSamplingRate="{rate}">
        <AudioChannelConfiguration schemeIdUri="{channel_scheme}" value="{channels}"/>
        <SegmentTemplate timescale="1000" duration="{chunk}" startNumber="{start_number}" initialization="{segment}/{init}" media="{segment}/{media}"/>
      </Representation>
    </AdaptationSet>
  </Period>
"#,
            id = period.id,
            start = iso_duration(period.start),
            duration = iso_duration(period.duration),
            mime = AUDIO_MIME,
            codec = AUDIO_CODEC,
            bandwidth = BANDWIDTH,
            rate = SAMPLE_RATE,
            channel_scheme = AUDIO_CHANNEL_SCHEME,
            channels = CHANNELS,
            chunk = self.settings.chunk_length.num_milliseconds(),
            start_number = period.start_number,
            segment = period.segment_id,
            init = INIT_NAME,
            media = CHUNK_TEMPLATE,
        )
    }

    pub fn render(&self) -> String {
        let mut mpd = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" profiles="{profile}" type="dynamic" availabilityStartTime="{ast}" publishTime="{published}" minimumUpdatePeriod="{mup}" minBufferTime="{mbt}" timeShiftBufferDepth="{tsbd}">
"#,
            profile = DASH_PROFILE,
            ast = iso_time(self.start_time),
            published = iso_time(self.published),
            mup = iso_duration(self.settings.minimum_update_period),
            mbt = iso_duration(self.settings.buffer_time),
            tsbd = iso_duration(self.settings.buffer_depth),
        );
        for period in &self.periods {
            mpd.push_str(&self.render_period(period));
        }
        mpd.push_str(&format!(
            "  <UTCTiming schemeIdUri=\"{}\" value=\"{}\"/>\n</MPD>\n",
            UTC_TIMING_SCHEME,
            xml_escape(&self.settings.utc_timing_url)
        ));
        mpd
    }

    /// Write the MPD to the configured path
    pub async fn dump(&self) -> std::io::Result<()> {
        tokio::fs::write(&self.settings.path, self.render()).await
    }

    /// Remove the MPD file; a missing file is fine
    pub async fn clean_up(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.settings.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
