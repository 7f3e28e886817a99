use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{Editors, Lives, Media, MediaTags, Metadata, Segments, Tags};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS media (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     name TEXT NOT NULL,
///     author TEXT NOT NULL,
///     duration_us INTEGER NOT NULL,
///     source_id TEXT NOT NULL
/// )
pub fn create_media_table() -> String {
    Table::create()
        .table(Media::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Media::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Media::Name).string().not_null())
        .col(ColumnDef::new(Media::Author).string().not_null())
        .col(ColumnDef::new(Media::DurationUs).big_integer().not_null())
        .col(ColumnDef::new(Media::SourceId).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS tags (id, name, kind, metadata)
pub fn create_tags_table() -> String {
    Table::create()
        .table(Tags::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Tags::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Tags::Name).string().not_null())
        .col(ColumnDef::new(Tags::Kind).string().not_null())
        .col(
            ColumnDef::new(Tags::Metadata)
                .string()
                .not_null()
                .default("{}"),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS media_tags (
///     media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
///     tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE
/// )
pub fn create_media_tags_table() -> String {
    Table::create()
        .table(MediaTags::Table)
        .if_not_exists()
        .col(ColumnDef::new(MediaTags::MediaId).big_integer().not_null())
        .col(ColumnDef::new(MediaTags::TagId).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(MediaTags::Table, MediaTags::MediaId)
                .to(Media::Table, Media::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .foreign_key(
            ForeignKey::create()
                .from(MediaTags::Table, MediaTags::TagId)
                .to(Tags::Table, Tags::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS segments (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     media_id INTEGER NOT NULL,
///     start_us INTEGER NOT NULL,
///     begin_cut_us INTEGER NOT NULL,
///     stop_cut_us INTEGER NOT NULL,
///     end_us INTEGER NOT NULL,
///     protected INTEGER NOT NULL DEFAULT 0,
///     live_id INTEGER NOT NULL DEFAULT 0
/// )
pub fn create_segments_table() -> String {
    Table::create()
        .table(Segments::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Segments::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Segments::MediaId).big_integer().not_null())
        .col(ColumnDef::new(Segments::StartUs).big_integer().not_null())
        .col(ColumnDef::new(Segments::BeginCutUs).big_integer().not_null())
        .col(ColumnDef::new(Segments::StopCutUs).big_integer().not_null())
        .col(ColumnDef::new(Segments::EndUs).big_integer().not_null())
        .col(
            ColumnDef::new(Segments::Protected)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(Segments::LiveId)
                .big_integer()
                .not_null()
                .default(0),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_segments_start ON segments(start_us)
pub fn create_segments_start_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_segments_start")
        .table(Segments::Table)
        .col(Segments::StartUs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_segments_media_id ON segments(media_id)
pub fn create_segments_media_id_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_segments_media_id")
        .table(Segments::Table)
        .col(Segments::MediaId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS lives (id, name, start_us, stop_us, delay_us, offset_us)
pub fn create_lives_table() -> String {
    Table::create()
        .table(Lives::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Lives::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Lives::Name).string().not_null())
        .col(ColumnDef::new(Lives::StartUs).big_integer().not_null())
        .col(ColumnDef::new(Lives::StopUs).big_integer().not_null())
        .col(ColumnDef::new(Lives::DelayUs).big_integer().not_null())
        .col(ColumnDef::new(Lives::OffsetUs).big_integer().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_lives_stop ON lives(stop_us)
pub fn create_lives_stop_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_lives_stop")
        .table(Lives::Table)
        .col(Lives::StopUs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS editors (id, login UNIQUE, pass_hash)
pub fn create_editors_table() -> String {
    Table::create()
        .table(Editors::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Editors::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(Editors::Login)
                .string()
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(Editors::PassHash).string().not_null())
        .to_string(SqliteQueryBuilder)
}
