// Library interface for the engine binary and integration tests

pub mod api;
pub mod auth;
pub mod autodj;
pub mod bus;
pub mod config;
pub mod constants;
pub mod dash;
pub mod db;
pub mod error;
pub mod live;
pub mod manifest;
pub mod model;
pub mod producer;
pub mod queries;
pub mod schema;
pub mod source;
pub mod store;

pub use constants::EXPECTED_DB_VERSION;
pub use error::{Error, Result};
