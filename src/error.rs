//! Error kinds surfaced by the timeline store and the editor-facing operations.
//!
//! The `Display` text of every variant is a short lowercase phrase. The HTTP
//! layer returns it verbatim as `{"error": "<phrase>"}`.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Login or password did not match
    InvalidCredentials,
    /// Missing or rejected bearer token
    Unauthorized,
    /// Referenced media does not exist
    MediaNotFound,
    /// Media is still referenced by at least one segment
    MediaInUse,
    /// Segment id does not exist
    SegmentNotFound,
    /// Played interval overlaps an existing segment
    SegmentIntersection,
    /// Cuts are negative or exceed the media duration
    CutOutOfBounds,
    /// `begin_cut > stop_cut`
    BeginAfterStop,
    /// A live-owned segment must not reference library media
    LiveSegmentHasMediaId,
    /// Live record id does not exist
    LiveNotFound,
    /// A store call ran past its deadline
    Timeout,
    EditorExists,
    EditorNotFound,
    /// Malformed request payload
    InvalidInput(String),
    /// Unexpected internal failure (hashing, token signing)
    Internal(String),
    Database(sqlx::Error),
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::MediaNotFound
                | Error::SegmentNotFound
                | Error::LiveNotFound
                | Error::EditorNotFound
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCredentials => write!(f, "invalid credentials"),
            Error::Unauthorized => write!(f, "unauthorized"),
            Error::MediaNotFound => write!(f, "media not found"),
            Error::MediaInUse => write!(f, "media is used by the schedule"),
            Error::SegmentNotFound => write!(f, "segment not found"),
            Error::SegmentIntersection => write!(f, "segment intersects with another segment"),
            Error::CutOutOfBounds => write!(f, "cut is out of media bounds"),
            Error::BeginAfterStop => write!(f, "begin cut is after stop cut"),
            Error::LiveSegmentHasMediaId => write!(f, "live segment has media id"),
            Error::LiveNotFound => write!(f, "live not found"),
            Error::Timeout => write!(f, "timeout"),
            Error::EditorExists => write!(f, "editor already exists"),
            Error::EditorNotFound => write!(f, "editor not found"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Database(e) => write!(f, "database error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
