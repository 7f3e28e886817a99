//! Timeline store: segments, live records, the media library and editors.
//!
//! Backed by SQLite through a single-connection pool, so every mutation is
//! serialized with respect to `schedule_cut`. Validation and the intersection
//! check run in the same transaction as the write they guard.

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::constants::MAX_MEDIA_DURATION_US;
use crate::error::{Error, Result};
use crate::model::{
    delta_micros, from_micros, to_micros, Editor, Live, Media, Segment, Tag, TagType, NO_MEDIA,
    OPEN_END_US,
};
use crate::queries::{editors, lives, media, segments, tags};

/// Deadline of a single store call made on behalf of a request
pub const STORE_DEADLINE: Duration = Duration::from_secs(5);

/// Run one store call under `STORE_DEADLINE`
pub async fn timed<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(STORE_DEADLINE, fut).await?
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn segment_from_row(row: &SqliteRow) -> Segment {
    Segment {
        id: row.get(0),
        media_id: row.get(1),
        start: from_micros(row.get(2)),
        begin_cut: TimeDelta::microseconds(row.get(3)),
        stop_cut: TimeDelta::microseconds(row.get(4)),
        protected: row.get::<i64, _>(5) != 0,
        live_id: row.get(6),
    }
}

fn live_from_row(row: &SqliteRow) -> Live {
    let stop_us: i64 = row.get(3);
    Live {
        id: row.get(0),
        name: row.get(1),
        start: from_micros(row.get(2)),
        stop: (stop_us != OPEN_END_US).then(|| from_micros(stop_us)),
        delay: TimeDelta::microseconds(row.get(4)),
        offset: TimeDelta::microseconds(row.get(5)),
    }
}

fn media_from_row(row: &SqliteRow) -> Media {
    Media {
        id: row.get(0),
        name: row.get(1),
        author: row.get(2),
        duration: TimeDelta::microseconds(row.get(3)),
        source_id: row.get(4),
        tags: BTreeSet::new(),
    }
}

/// Shape checks that need no database access
fn check_cuts(segment: &Segment) -> Result<()> {
    if segment.is_live() && segment.media_id != NO_MEDIA {
        return Err(Error::LiveSegmentHasMediaId);
    }
    if segment.begin_cut > segment.stop_cut {
        return Err(Error::BeginAfterStop);
    }
    if segment.begin_cut < TimeDelta::zero() {
        return Err(Error::CutOutOfBounds);
    }
    // The played end must be representable both as a time and in end_us
    segment
        .start
        .checked_add_signed(segment.duration())
        .ok_or(Error::CutOutOfBounds)?;
    to_micros(segment.start)
        .checked_add(delta_micros(segment.duration()))
        .ok_or(Error::CutOutOfBounds)?;
    Ok(())
}

async fn fetch_media(conn: &mut SqliteConnection, id: i64) -> Result<Option<Media>> {
    let row = sqlx::query(&media::select_by_id(id))
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut m = media_from_row(&row);
    let tag_rows = sqlx::query(&tags::select_media_tags(Some(id)))
        .fetch_all(&mut *conn)
        .await?;
    m.tags = tag_rows.iter().map(|r| r.get::<i64, _>(1)).collect();
    Ok(Some(m))
}

/// Library media must exist and cover the cuts; live segments need their live record.
async fn check_source(conn: &mut SqliteConnection, segment: &Segment) -> Result<()> {
    if segment.is_live() {
        let found = sqlx::query(&lives::select_by_id(segment.live_id))
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_none() {
            return Err(Error::LiveNotFound);
        }
        return Ok(());
    }
    let m = fetch_media(conn, segment.media_id)
        .await?
        .ok_or(Error::MediaNotFound)?;
    if segment.stop_cut > m.duration {
        return Err(Error::CutOutOfBounds);
    }
    Ok(())
}

async fn intersects(
    conn: &mut SqliteConnection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_id: Option<i64>,
) -> Result<bool> {
    if end <= start {
        return Ok(false);
    }
    let row = sqlx::query(&segments::select_predecessor(to_micros(end), exclude_id))
        .fetch_optional(&mut *conn)
        .await?;
    Ok(match row {
        Some(row) => row.get::<i64, _>(1) > to_micros(start),
        None => false,
    })
}

/// An unprotected segment must fit into free time. A protected one displaces
/// the unprotected segments it overlaps and only yields to other reservations.
/// Returns the number of displaced segments.
async fn make_room(
    conn: &mut SqliteConnection,
    segment: &Segment,
    exclude_id: Option<i64>,
) -> Result<u64> {
    if !segment.protected {
        if intersects(conn, segment.start, segment.end(), exclude_id).await? {
            return Err(Error::SegmentIntersection);
        }
        return Ok(0);
    }
    if segment.end() <= segment.start {
        return Ok(0);
    }

    let sql = segments::select_overlapping(to_micros(segment.start), to_micros(segment.end()), exclude_id);
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    let overlapping: Vec<Segment> = rows.iter().map(segment_from_row).collect();
    if overlapping.iter().any(|s| s.protected) {
        return Err(Error::SegmentIntersection);
    }
    if overlapping.is_empty() {
        return Ok(0);
    }
    let ids: Vec<i64> = overlapping.iter().map(|s| s.id).collect();
    sqlx::query(&segments::delete_by_ids(&ids))
        .execute(&mut *conn)
        .await?;
    Ok(ids.len() as u64)
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and initialize its schema
    pub async fn open(path: &Path) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let pool = crate::db::open_database(path).await?;
        crate::db::init_database_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Fresh in-memory store, used by tests
    pub async fn in_memory() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let pool = crate::db::open_in_memory().await?;
        crate::db::init_database_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    /// Segments whose played interval intersects `[start, stop]`, ascending by start
    pub async fn schedule_cut(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<Vec<Segment>> {
        self.cut_us(to_micros(start), to_micros(stop)).await
    }

    /// Segments playing at or after `start`
    pub async fn schedule_from(&self, start: DateTime<Utc>) -> Result<Vec<Segment>> {
        self.cut_us(to_micros(start), i64::MAX).await
    }

    async fn cut_us(&self, start_us: i64, stop_us: i64) -> Result<Vec<Segment>> {
        let rows = sqlx::query(&segments::select_intersecting(start_us, stop_us))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(segment_from_row).collect())
    }

    pub async fn segment(&self, id: i64) -> Result<Segment> {
        let row = sqlx::query(&segments::select_by_id(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| segment_from_row(&r)).ok_or(Error::SegmentNotFound)
    }

    /// Insert a segment and return its id.
    ///
    /// A protected segment replaces the unprotected segments it overlaps.
    pub async fn save_segment(&self, segment: &Segment) -> Result<i64> {
        let segment = segment.normalized();
        check_cuts(&segment)?;

        let mut tx = self.pool.begin().await?;
        check_source(&mut *tx, &segment).await?;
        let displaced = make_room(&mut *tx, &segment, None).await?;

        let sql = segments::insert(
            segment.media_id,
            to_micros(segment.start),
            delta_micros(segment.begin_cut),
            delta_micros(segment.stop_cut),
            segment.protected,
            segment.live_id,
        );
        let id = sqlx::query(&sql).execute(&mut *tx).await?.last_insert_rowid();
        tx.commit().await?;

        debug!(
            "Saved segment {} (media {}, live {}) at {} for {}ms, displaced {}",
            id,
            segment.media_id,
            segment.live_id,
            segment.start,
            segment.duration().num_milliseconds(),
            displaced
        );
        Ok(id)
    }

    /// Change `start`, `begin_cut` and `stop_cut` of an existing segment.
    /// Ownership fields (`media_id`, `protected`, `live_id`) are kept as stored.
    pub async fn update_segment_timing(&self, segment: &Segment) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&segments::select_by_id(segment.id))
            .fetch_optional(&mut *tx)
            .await?;
        let stored = row.map(|r| segment_from_row(&r)).ok_or(Error::SegmentNotFound)?;

        let updated = Segment {
            start: segment.start,
            begin_cut: segment.begin_cut,
            stop_cut: segment.stop_cut,
            ..stored
        }
        .normalized();
        check_cuts(&updated)?;
        check_source(&mut *tx, &updated).await?;
        let displaced = make_room(&mut *tx, &updated, Some(updated.id)).await?;
        if displaced > 0 {
            debug!("Segment {} displaced {} segments", updated.id, displaced);
        }

        let sql = segments::update_timing(
            updated.id,
            to_micros(updated.start),
            delta_micros(updated.begin_cut),
            delta_micros(updated.stop_cut),
        );
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_segment(&self, id: i64) -> Result<()> {
        let result = sqlx::query(&segments::delete_by_id(id))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::SegmentNotFound);
        }
        Ok(())
    }

    /// Delete every segment starting at or after `from`; returns the count
    pub async fn clear_schedule(&self, from: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&segments::delete_from(to_micros(from), false))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete unprotected segments starting at or after `from`; returns the count
    pub async fn clear_unprotected(&self, from: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&segments::delete_from(to_micros(from), true))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Lives
    // ------------------------------------------------------------------

    pub async fn new_live(&self, live: &Live) -> Result<i64> {
        let stop_us = live.stop.map(to_micros).unwrap_or(OPEN_END_US);
        let sql = lives::insert(
            &live.name,
            to_micros(live.start),
            stop_us,
            delta_micros(live.delay),
            delta_micros(live.offset),
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Persist `live.stop` (finalization)
    pub async fn set_live_stop(&self, live: &Live) -> Result<()> {
        let stop_us = live.stop.map(to_micros).unwrap_or(OPEN_END_US);
        let result = sqlx::query(&lives::update_stop(live.id, stop_us))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::LiveNotFound);
        }
        Ok(())
    }

    pub async fn live(&self, id: i64) -> Result<Live> {
        let row = sqlx::query(&lives::select_by_id(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| live_from_row(&r)).ok_or(Error::LiveNotFound)
    }

    /// Live records whose stop is after `after` (open ones included)
    pub async fn lives(&self, after: DateTime<Utc>) -> Result<Vec<Live>> {
        let rows = sqlx::query(&lives::select_stopping_after(to_micros(after)))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(live_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Library
    // ------------------------------------------------------------------

    pub async fn new_media(&self, m: &Media) -> Result<i64> {
        if m.duration <= TimeDelta::zero() {
            return Err(Error::InvalidInput("media duration must be positive".to_string()));
        }
        if m.duration > TimeDelta::microseconds(MAX_MEDIA_DURATION_US) {
            return Err(Error::InvalidInput("media duration exceeds 24h".to_string()));
        }
        let mut tx = self.pool.begin().await?;
        if !m.tags.is_empty() {
            let ids: Vec<i64> = m.tags.iter().copied().collect();
            let found: i64 = sqlx::query_scalar(&tags::count_existing(&ids))
                .fetch_one(&mut *tx)
                .await?;
            if found as usize != ids.len() {
                return Err(Error::InvalidInput("unknown tag".to_string()));
            }
        }

        let sql = media::insert(&m.name, &m.author, delta_micros(m.duration), &m.source_id);
        let id = sqlx::query(&sql).execute(&mut *tx).await?.last_insert_rowid();
        for tag_id in &m.tags {
            sqlx::query(&tags::insert_media_tag(id, *tag_id))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    pub async fn media(&self, id: i64) -> Result<Media> {
        let mut conn = self.pool.acquire().await?;
        fetch_media(&mut *conn, id).await?.ok_or(Error::MediaNotFound)
    }

    pub async fn media_list(&self) -> Result<Vec<Media>> {
        let rows = sqlx::query(&media::select_all()).fetch_all(&self.pool).await?;
        self.with_tags(rows.iter().map(media_from_row).collect()).await
    }

    /// Media carrying any of `tag_ids`; the whole library when empty
    pub async fn media_by_tags(&self, tag_ids: &[i64]) -> Result<Vec<Media>> {
        if tag_ids.is_empty() {
            return self.media_list().await;
        }
        let rows = sqlx::query(&media::select_by_any_tag(tag_ids))
            .fetch_all(&self.pool)
            .await?;
        self.with_tags(rows.iter().map(media_from_row).collect()).await
    }

    async fn with_tags(&self, mut list: Vec<Media>) -> Result<Vec<Media>> {
        let rows = sqlx::query(&tags::select_media_tags(None))
            .fetch_all(&self.pool)
            .await?;
        let mut by_media: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for row in &rows {
            by_media
                .entry(row.get::<i64, _>(0))
                .or_default()
                .insert(row.get::<i64, _>(1));
        }
        for m in &mut list {
            m.tags = by_media.remove(&m.id).unwrap_or_default();
        }
        Ok(list)
    }

    /// Delete a media record that no segment references; returns the deleted record
    pub async fn delete_media(&self, id: i64) -> Result<Media> {
        let mut tx = self.pool.begin().await?;
        let m = fetch_media(&mut *tx, id).await?.ok_or(Error::MediaNotFound)?;
        let used: i64 = sqlx::query_scalar(&segments::exists_for_media(id))
            .fetch_one(&mut *tx)
            .await?;
        if used != 0 {
            return Err(Error::MediaInUse);
        }
        sqlx::query(&tags::delete_media_tags(id)).execute(&mut *tx).await?;
        sqlx::query(&media::delete_by_id(id)).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(m)
    }

    pub async fn new_tag(&self, tag: &Tag) -> Result<i64> {
        let metadata = serde_json::to_string(&tag.metadata)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let sql = tags::insert(&tag.name, tag.kind.as_str(), &metadata);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query(&tags::select_all()).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| Tag {
                id: row.get(0),
                name: row.get(1),
                kind: TagType::parse(&row.get::<String, _>(2)),
                metadata: serde_json::from_str::<BTreeMap<String, String>>(&row.get::<String, _>(3))
                    .unwrap_or_default(),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Editors
    // ------------------------------------------------------------------

    pub async fn new_editor(&self, login: &str, pass_hash: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(&editors::select_by_login(login))
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(Error::EditorExists);
        }
        let id = sqlx::query(&editors::insert(login, pass_hash))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        tx.commit().await?;
        Ok(id)
    }

    pub async fn editor(&self, login: &str) -> Result<Editor> {
        let row = sqlx::query(&editors::select_by_login(login))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Editor {
            id: r.get(0),
            login: r.get(1),
            pass_hash: r.get(2),
        })
        .ok_or(Error::EditorNotFound)
    }

    pub async fn delete_editor(&self, login: &str) -> Result<()> {
        let result = sqlx::query(&editors::delete_by_login(login))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::EditorNotFound);
        }
        Ok(())
    }
}
