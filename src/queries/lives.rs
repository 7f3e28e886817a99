use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Lives;

const COLUMNS: [Lives; 6] = [
    Lives::Id,
    Lives::Name,
    Lives::StartUs,
    Lives::StopUs,
    Lives::DelayUs,
    Lives::OffsetUs,
];

/// INSERT INTO lives (name, start_us, stop_us, delay_us, offset_us) VALUES (?, ?, ?, ?, ?)
pub fn insert(name: &str, start_us: i64, stop_us: i64, delay_us: i64, offset_us: i64) -> String {
    Query::insert()
        .into_table(Lives::Table)
        .columns([
            Lives::Name,
            Lives::StartUs,
            Lives::StopUs,
            Lives::DelayUs,
            Lives::OffsetUs,
        ])
        .values_panic([
            name.into(),
            start_us.into(),
            stop_us.into(),
            delay_us.into(),
            offset_us.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lives SET stop_us = ? WHERE id = ?
pub fn update_stop(id: i64, stop_us: i64) -> String {
    Query::update()
        .table(Lives::Table)
        .value(Lives::StopUs, stop_us)
        .and_where(Expr::col(Lives::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM lives WHERE id = ?
pub fn select_by_id(id: i64) -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Lives::Table)
        .and_where(Expr::col(Lives::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM lives WHERE stop_us > ? ORDER BY start_us
pub fn select_stopping_after(after_us: i64) -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Lives::Table)
        .and_where(Expr::col(Lives::StopUs).gt(after_us))
        .order_by(Lives::StartUs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
