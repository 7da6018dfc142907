//! Error types for the orchestrator.

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, SystemError>;

/// Coarse classification used by callers to decide whether to keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Settings or vocabulary cannot be used; the process should exit.
    FatalConfig,
    /// Map storage is unusable (cannot write, or a file opened but is corrupt).
    FatalIo,
    /// An I/O failure the system can continue past.
    RecoverableIo,
    /// The caller broke the API contract (wrong sensor entry point, use after
    /// shutdown, unsupported export for the sensor).
    ProtocolViolation,
}

/// Orchestrator error types
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Settings file unreadable or malformed
    #[error("Failed to load settings from {path}: {reason}")]
    Settings { path: PathBuf, reason: String },

    /// Vocabulary missing or unparseable
    #[error("Failed to load vocabulary from {path}: {reason}")]
    Vocabulary { path: PathBuf, reason: String },

    /// Map file cannot be created or written
    #[error("Cannot write map file {path}: {source}")]
    MapWrite {
        path: PathBuf,
        #[source]
        source: Box<bincode::ErrorKind>,
    },

    /// Map file opened but its content cannot be decoded
    #[error("Corrupt map file {path}: {reason}")]
    CorruptMap { path: PathBuf, reason: String },

    /// Trajectory file cannot be written
    #[error("Cannot write trajectory file {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Session subsystems could not be constructed
    #[error("Failed to build session subsystems: {0}")]
    SessionBuild(String),

    /// API contract violation
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl SystemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SystemError::Settings { .. } | SystemError::Vocabulary { .. } => ErrorKind::FatalConfig,
            SystemError::MapWrite { .. } | SystemError::CorruptMap { .. } => ErrorKind::FatalIo,
            SystemError::Export { .. } | SystemError::SessionBuild(_) => ErrorKind::RecoverableIo,
            SystemError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// True when the process cannot meaningfully continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::FatalConfig | ErrorKind::FatalIo)
    }
}
