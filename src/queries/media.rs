use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::{Media, MediaTags};

const COLUMNS: [Media; 5] = [
    Media::Id,
    Media::Name,
    Media::Author,
    Media::DurationUs,
    Media::SourceId,
];

/// INSERT INTO media (name, author, duration_us, source_id) VALUES (?, ?, ?, ?)
pub fn insert(name: &str, author: &str, duration_us: i64, source_id: &str) -> String {
    Query::insert()
        .into_table(Media::Table)
        .columns([Media::Name, Media::Author, Media::DurationUs, Media::SourceId])
        .values_panic([
            name.into(),
            author.into(),
            duration_us.into(),
            source_id.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM media WHERE id = ?
pub fn select_by_id(id: i64) -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Media::Table)
        .and_where(Expr::col(Media::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM media ORDER BY id
pub fn select_all() -> String {
    Query::select()
        .columns(COLUMNS)
        .from(Media::Table)
        .order_by(Media::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT DISTINCT m.* FROM media m
/// INNER JOIN media_tags mt ON m.id = mt.media_id
/// WHERE mt.tag_id IN (...)
/// ORDER BY m.id
pub fn select_by_any_tag(tag_ids: &[i64]) -> String {
    Query::select()
        .distinct()
        .columns(COLUMNS.map(|c| (Media::Table, c)))
        .from(Media::Table)
        .inner_join(
            MediaTags::Table,
            Expr::col((Media::Table, Media::Id)).equals((MediaTags::Table, MediaTags::MediaId)),
        )
        .and_where(Expr::col((MediaTags::Table, MediaTags::TagId)).is_in(tag_ids.iter().copied()))
        .order_by((Media::Table, Media::Id), Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM media WHERE id = ?
pub fn delete_by_id(id: i64) -> String {
    Query::delete()
        .from_table(Media::Table)
        .and_where(Expr::col(Media::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}
