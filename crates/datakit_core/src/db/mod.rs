//! SQLite storage bootstrap, layout migrations and schema metadata.
//!
//! # Responsibility
//! - Open and configure file or in-memory SQLite connections.
//! - Apply internal layout migrations in deterministic order.
//! - Persist the managed object schema alongside the data.
//!
//! # Invariants
//! - Layout version is tracked via `PRAGMA user_version`.
//! - No object rows are read or written before layout migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod metadata;
pub mod migrations;
mod open;

pub use open::{open_store_file, open_store_in_memory};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Json(serde_json::Error),
    UnsupportedLayoutVersion {
        db_version: u32,
        latest_supported: u32,
    },
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "invalid stored json: {err}"),
            Self::UnsupportedLayoutVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "store layout version {db_version} is newer than supported {latest_supported}"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::UnsupportedLayoutVersion { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
