//! Shared error classification.
//!
//! # Responsibility
//! - Map every module error onto the four failure classes the host workflow
//!   reacts to.
//!
//! # Invariants
//! - `Format` failures on optional columns are reported as warnings by the
//!   converters and never reach this type.
//! - `Io`, `ExternalProcess` and `Configuration` failures abort the current
//!   step; nothing is retried in-process.

use std::fmt::{Display, Formatter};

/// Failure class used when reporting a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed table, missing columns or unreadable volume header.
    Format,
    /// Missing input file or unwritable output.
    Io,
    /// External program returned non-zero or could not be spawned.
    ExternalProcess,
    /// Invalid parameters or incompatible build toolchain.
    Configuration,
}

impl ErrorKind {
    /// Stable string id used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Io => "io",
            Self::ExternalProcess => "external_process",
            Self::Configuration => "configuration",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn error_kinds_have_stable_ids() {
        assert_eq!(ErrorKind::Format.to_string(), "format");
        assert_eq!(ErrorKind::Io.to_string(), "io");
        assert_eq!(ErrorKind::ExternalProcess.to_string(), "external_process");
        assert_eq!(ErrorKind::Configuration.to_string(), "configuration");
    }
}
