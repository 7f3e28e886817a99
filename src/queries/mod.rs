//! SQL builders. Each function returns a complete SQLite statement.

pub mod ddl;
pub mod editors;
pub mod lives;
pub mod media;
pub mod metadata;
pub mod segments;
pub mod tags;
