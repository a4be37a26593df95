//! SQLite store behind the output catalog.
//!
//! # Responsibility
//! - Open catalog databases and bring their schema up to date.
//!
//! # Invariants
//! - Schema version lives in `PRAGMA user_version`.
//! - No catalog query runs before migrations have been applied.

use crate::error::ErrorKind;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// Database was written by a newer release.
    SchemaTooNew { found: u32, supported: u32 },
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlite(_) => ErrorKind::Io,
            Self::SchemaTooNew { .. } => ErrorKind::Configuration,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "catalog database error: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "catalog schema version {found} is newer than supported {supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
