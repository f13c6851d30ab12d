//! Error types for the controller core.
//!
//! Each component has its own error enum. Registry file errors are contained
//! per file during a scan, event-log errors always propagate, and a scheduling
//! conflict is reported but never aborts a tick.

use crate::common::ProgramId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the program registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The referenced program id is not in the registry.
    #[error("program not found: {0}")]
    NotFound(ProgramId),

    /// Reading, writing or removing a program file failed.
    #[error("program file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A program file could not be (de)serialized.
    #[error("program file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A program file parsed but describes a program the registry rejects.
    #[error("program file {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors produced by the event log. Any of these means an audit row may not
/// have been recorded.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("event log schema migration failed: {0}")]
    Migration(String),

    /// A stored code did not map back to a known enum value.
    #[error("unknown {kind} code {code} in event log")]
    UnknownCode { kind: &'static str, code: i64 },
}

/// Errors produced while moving programs between idle and running.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("program not found: {0}")]
    NotFound(ProgramId),

    /// A program became eligible to start while another owns the station
    /// sequence. The running program is never preempted.
    #[error("configuration conflict: {eligible} is eligible to start while {running} is running")]
    ConfigurationConflict {
        running: ProgramId,
        eligible: ProgramId,
    },

    #[error(transparent)]
    Storage(#[from] EventLogError),
}
