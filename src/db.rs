use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::constants::EXPECTED_DB_VERSION;
use crate::queries::{ddl, metadata};

type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Open a file-based database for production use
/// Enables WAL mode and foreign keys. A single connection serializes every
/// timeline write.
pub async fn open_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Create an in-memory database pool
/// The single connection is never recycled, otherwise the database would vanish.
pub async fn open_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Create a database in a temporary directory for tests
/// Returns (pool, guard) - keep guard alive to prevent temp file deletion
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), DynError> {
    let dir = tempfile::tempdir()?;
    let pool = open_database(&dir.path().join("test.sqlite")).await?;
    Ok((pool, dir))
}

/// Initialize database schema
/// Creates tables and indexes, then records or checks the schema version
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), DynError> {
    for sql in [
        ddl::create_metadata_table(),
        ddl::create_media_table(),
        ddl::create_tags_table(),
        ddl::create_media_tags_table(),
        ddl::create_segments_table(),
        ddl::create_segments_start_index(),
        ddl::create_segments_media_id_index(),
        ddl::create_lives_table(),
        ddl::create_lives_stop_index(),
        ddl::create_editors_table(),
    ] {
        sqlx::query(&sql).execute(pool).await?;
    }

    let existing = sqlx::query(&metadata::select_by_key("version"))
        .fetch_optional(pool)
        .await?
        .map(|row| row.get::<String, _>(0));

    match existing {
        None => {
            sqlx::query(&metadata::insert("version", EXPECTED_DB_VERSION))
                .execute(pool)
                .await?;
        }
        Some(version) if version != EXPECTED_DB_VERSION => {
            return Err(format!(
                "Unsupported database version: '{}'. This application only supports version '{}'",
                version, EXPECTED_DB_VERSION
            )
            .into());
        }
        Some(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        init_database_schema(&pool).await.unwrap();
        init_database_schema(&pool).await.unwrap();

        let version: String = sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'version'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, EXPECTED_DB_VERSION);
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let (pool, _dir) = create_test_connection_in_temporary_file().await.unwrap();
        init_database_schema(&pool).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[tokio::test]
    async fn test_rejects_foreign_version() {
        let pool = open_in_memory().await.unwrap();
        init_database_schema(&pool).await.unwrap();
        sqlx::query(&metadata::upsert("version", "0"))
            .execute(&pool)
            .await
            .unwrap();

        assert!(init_database_schema(&pool).await.is_err());
    }
}
