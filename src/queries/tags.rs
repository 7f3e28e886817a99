use sea_query::{Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::schema::{MediaTags, Tags};

/// INSERT INTO tags (name, kind, metadata) VALUES (?, ?, ?)
pub fn insert(name: &str, kind: &str, metadata_json: &str) -> String {
    Query::insert()
        .into_table(Tags::Table)
        .columns([Tags::Name, Tags::Kind, Tags::Metadata])
        .values_panic([name.into(), kind.into(), metadata_json.into()])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, name, kind, metadata FROM tags ORDER BY id
pub fn select_all() -> String {
    Query::select()
        .columns([Tags::Id, Tags::Name, Tags::Kind, Tags::Metadata])
        .from(Tags::Table)
        .order_by(Tags::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM tags WHERE id IN (...)
pub fn count_existing(ids: &[i64]) -> String {
    Query::select()
        .expr(Func::count(Expr::col(Tags::Id)))
        .from(Tags::Table)
        .and_where(Expr::col(Tags::Id).is_in(ids.iter().copied()))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO media_tags (media_id, tag_id) VALUES (?, ?)
pub fn insert_media_tag(media_id: i64, tag_id: i64) -> String {
    Query::insert()
        .into_table(MediaTags::Table)
        .columns([MediaTags::MediaId, MediaTags::TagId])
        .values_panic([media_id.into(), tag_id.into()])
        .to_string(SqliteQueryBuilder)
}

/// SELECT media_id, tag_id FROM media_tags [WHERE media_id = ?]
pub fn select_media_tags(media_id: Option<i64>) -> String {
    let mut query = Query::select();
    query
        .columns([MediaTags::MediaId, MediaTags::TagId])
        .from(MediaTags::Table);
    if let Some(id) = media_id {
        query.and_where(Expr::col(MediaTags::MediaId).eq(id));
    }
    query.to_string(SqliteQueryBuilder)
}

/// DELETE FROM media_tags WHERE media_id = ?
pub fn delete_media_tags(media_id: i64) -> String {
    Query::delete()
        .from_table(MediaTags::Table)
        .and_where(Expr::col(MediaTags::MediaId).eq(media_id))
        .to_string(SqliteQueryBuilder)
}
