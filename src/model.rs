//! Timeline data model: library media, tags, segments and live records.
//!
//! All time fields are kept at microsecond precision. Wall-clock instants are
//! `DateTime<Utc>` (RFC 3339 on the wire), offsets inside a medium are
//! `TimeDelta` serialized as integer microseconds.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// `media_id` of a segment that does not play library media (live capture)
pub const NO_MEDIA: i64 = 0;

/// `live_id` of a segment that is not owned by a live record
pub const NO_LIVE: i64 = 0;

/// Stored value of an unbounded live `stop`
pub const OPEN_END_US: i64 = i64::MAX;

pub fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn delta_micros(d: TimeDelta) -> i64 {
    d.num_microseconds().unwrap_or(i64::MAX)
}

/// Seconds (fractional allowed) to a microsecond-rounded delta
pub fn seconds(secs: f64) -> TimeDelta {
    TimeDelta::microseconds((secs * 1_000_000.0).round() as i64)
}

/// Negative deltas clamp to zero
pub fn to_std(d: TimeDelta) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Serde adapter: `TimeDelta` as integer microseconds
pub mod micros {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(super::delta_micros(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TimeDelta, D::Error> {
        let us = i64::deserialize(d)?;
        Ok(TimeDelta::microseconds(us))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Genre,
    Mood,
    Artist,
    Language,
    Era,
    Other,
}

impl TagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Genre => "genre",
            TagType::Mood => "mood",
            TagType::Artist => "artist",
            TagType::Language => "language",
            TagType::Era => "era",
            TagType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> TagType {
        match s {
            "genre" => TagType::Genre,
            "mood" => TagType::Mood,
            "artist" => TagType::Artist,
            "language" => TagType::Language,
            "era" => TagType::Era,
            _ => TagType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TagType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Immutable library record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(with = "micros")]
    pub duration: TimeDelta,
    #[serde(default)]
    pub source_id: String,
    /// Tag ids
    #[serde(default)]
    pub tags: BTreeSet<i64>,
}

/// A timeline placement of (a slice of) a medium
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub media_id: i64,
    pub start: DateTime<Utc>,
    #[serde(with = "micros")]
    pub begin_cut: TimeDelta,
    #[serde(with = "micros")]
    pub stop_cut: TimeDelta,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub live_id: i64,
}

impl Segment {
    /// Played length, `stop_cut - begin_cut`
    pub fn duration(&self) -> TimeDelta {
        self.stop_cut - self.begin_cut
    }

    /// Exclusive end of the played interval, saturating at the end of time
    pub fn end(&self) -> DateTime<Utc> {
        self.start
            .checked_add_signed(self.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_live(&self) -> bool {
        self.live_id != NO_LIVE
    }

    /// Whether `t` falls inside `[start, end)`
    pub fn plays_at(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end()
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end()
    }

    /// Truncate every time field to microseconds; live segments are always protected.
    pub fn normalized(&self) -> Segment {
        let mut s = self.clone();
        s.start = s.start.trunc_subsecs(6);
        s.begin_cut = TimeDelta::microseconds(delta_micros(s.begin_cut));
        s.stop_cut = TimeDelta::microseconds(delta_micros(s.stop_cut));
        if s.is_live() {
            s.protected = true;
        }
        s
    }
}

/// A live capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Live {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub start: DateTime<Utc>,
    /// `None` until the capture is finalized
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    /// Minimum end-to-end capture latency
    #[serde(with = "micros")]
    pub delay: TimeDelta,
    /// Realized offset between activation and `start`
    #[serde(with = "micros")]
    pub offset: TimeDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Editor {
    pub id: i64,
    pub login: String,
    #[serde(skip)]
    pub pass_hash: String,
}
