use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Segments;

const COLUMNS: [Segments; 7] = [
    Segments::Id,
    Segments::MediaId,
    Segments::StartUs,
    Segments::BeginCutUs,
    Segments::StopCutUs,
    Segments::Protected,
    Segments::LiveId,
];

/// INSERT INTO segments (media_id, start_us, begin_cut_us, stop_cut_us, end_us, protected, live_id)
/// VALUES (?, ?, ?, ?, ?, ?, ?)
pub fn insert(
    media_id: i64,
    start_us: i64,
    begin_cut_us: i64,
    stop_cut_us: i64,
    protected: bool,
    live_id: i64,
) -> String {
    Query::insert()
        .into_table(Segments::Table)
        .columns([
            Segments::MediaId,
            Segments::StartUs,
            Segments::BeginCutUs,
            Segments::StopCutUs,
            Segments::EndUs,
            Segments::Protected,
            Segments::LiveId,
        ])
        .values_panic([
            media_id.into(),
            start_us.into(),
            begin_cut_us.into(),
            stop_cut_us.into(),
            (start_us + stop_cut_us - begin_cut_us).into(),
            (protected as i32).into(),
            live_id.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM segments WHERE id = ?
pub fn select_by_id(id: i64) -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Segments::Table)
        .and_where(Expr::col(Segments::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM segments WHERE start_us <= ? AND end_us > ? ORDER BY start_us
///
/// Segments whose played interval intersects `[start_us, stop_us]`.
pub fn select_intersecting(start_us: i64, stop_us: i64) -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Segments::Table)
        .and_where(Expr::col(Segments::StartUs).lte(stop_us))
        .and_where(Expr::col(Segments::EndUs).gt(start_us))
        .order_by(Segments::StartUs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM segments WHERE start_us < ? AND end_us > ? [AND id != ?] ORDER BY start_us
///
/// Segments sharing played time with `[start_us, end_us)`.
pub fn select_overlapping(start_us: i64, end_us: i64, exclude_id: Option<i64>) -> String {
    let mut query = Query::select();
    query
        .columns(COLUMNS)
        .from(Segments::Table)
        .and_where(Expr::col(Segments::StartUs).lt(end_us))
        .and_where(Expr::col(Segments::EndUs).gt(start_us));
    if let Some(id) = exclude_id {
        query.and_where(Expr::col(Segments::Id).ne(id));
    }
    query
        .order_by(Segments::StartUs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, end_us FROM segments
/// WHERE start_us < ? AND end_us > start_us [AND id != ?]
/// ORDER BY start_us DESC LIMIT 1
///
/// Predecessor lookup over the start index: with no overlaps stored, only the
/// latest non-empty segment starting before `end_us` can intersect a new
/// interval ending there.
pub fn select_predecessor(end_us: i64, exclude_id: Option<i64>) -> String {
    let mut query = Query::select();
    query
        .columns([Segments::Id, Segments::EndUs])
        .from(Segments::Table)
        .and_where(Expr::col(Segments::StartUs).lt(end_us))
        .and_where(Expr::col(Segments::EndUs).gt(Expr::col(Segments::StartUs)));
    if let Some(id) = exclude_id {
        query.and_where(Expr::col(Segments::Id).ne(id));
    }
    query
        .order_by(Segments::StartUs, Order::Desc)
        .limit(1)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE segments SET start_us = ?, begin_cut_us = ?, stop_cut_us = ?, end_us = ? WHERE id = ?
pub fn update_timing(id: i64, start_us: i64, begin_cut_us: i64, stop_cut_us: i64) -> String {
    Query::update()
        .table(Segments::Table)
        .values([
            (Segments::StartUs, start_us.into()),
            (Segments::BeginCutUs, begin_cut_us.into()),
            (Segments::StopCutUs, stop_cut_us.into()),
            (Segments::EndUs, (start_us + stop_cut_us - begin_cut_us).into()),
        ])
        .and_where(Expr::col(Segments::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM segments WHERE id = ?
pub fn delete_by_id(id: i64) -> String {
    Query::delete()
        .from_table(Segments::Table)
        .and_where(Expr::col(Segments::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM segments WHERE id IN (...)
pub fn delete_by_ids(ids: &[i64]) -> String {
    Query::delete()
        .from_table(Segments::Table)
        .and_where(Expr::col(Segments::Id).is_in(ids.iter().copied()))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM segments WHERE start_us >= ? [AND protected = 0]
pub fn delete_from(from_us: i64, unprotected_only: bool) -> String {
    let mut query = Query::delete();
    query
        .from_table(Segments::Table)
        .and_where(Expr::col(Segments::StartUs).gte(from_us));
    if unprotected_only {
        query.and_where(Expr::col(Segments::Protected).eq(0));
    }
    query.to_string(SqliteQueryBuilder)
}

/// SELECT EXISTS(SELECT 1 FROM segments WHERE media_id = ?)
pub fn exists_for_media(media_id: i64) -> String {
    let subquery = Query::select()
        .expr(Expr::val(1))
        .from(Segments::Table)
        .and_where(Expr::col(Segments::MediaId).eq(media_id))
        .to_owned();

    Query::select()
        .expr(Expr::exists(subquery))
        .to_string(SqliteQueryBuilder)
}
