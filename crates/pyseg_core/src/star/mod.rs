//! Star tables: the interchange format with the PySeg programs.
//!
//! # Responsibility
//! - Read and write row-oriented star tables.
//! - Split tables into packages and merge package results.
//!
//! # Invariants
//! - All rows of a table share the same column set.
//! - Absent columns are never an error on lookup; callers get the
//!   `NOT_FOUND` sentinel or an explicit numeric default.

use crate::error::ErrorKind;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

mod io;
pub mod labels;
pub mod split;
mod table;

pub use split::{merge_star_files, split_star_file, split_table, DEFAULT_SPLIT_PREFIX};
pub use table::{Row, StarValue, Table};

/// Star table read/write failures.
#[derive(Debug)]
pub enum StarError {
    MissingFile(PathBuf),
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    RowWidth {
        expected: usize,
        found: usize,
    },
    EmptyTable(PathBuf),
    ColumnMismatch(PathBuf),
    InvalidGroupSize(usize),
    NoInputs,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidGroupSize(_) => ErrorKind::Configuration,
            _ => ErrorKind::Format,
        }
    }
}

impl Display for StarError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "star file not found: {}", path.display()),
            Self::Malformed {
                path,
                line,
                message,
            } => write!(f, "malformed star file {}:{line}: {message}", path.display()),
            Self::RowWidth { expected, found } => {
                write!(f, "row has {found} values, table declares {expected} columns")
            }
            Self::EmptyTable(path) => write!(f, "star table is empty: {}", path.display()),
            Self::ColumnMismatch(path) => write!(
                f,
                "star file columns differ from the first merged file: {}",
                path.display()
            ),
            Self::InvalidGroupSize(size) => {
                write!(f, "group size must be greater than zero, got {size}")
            }
            Self::NoInputs => write!(f, "no star files given"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl Error for StarError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
