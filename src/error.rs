//! WolfMember Error Types

use thiserror::Error;

use crate::member::LogIndex;

/// Result type alias for WolfMember operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMember error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log errors
    #[error("Log index {index} is outside the readable range {first}..={last}")]
    LogIndexOutOfRange {
        index: LogIndex,
        first: LogIndex,
        last: LogIndex,
    },

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("Membership state corrupted: {0}")]
    StateCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Listener errors
    #[error("Membership listener failed: {0}")]
    Listener(String),

    // Join errors
    #[error("Timed out after {0:?} waiting to become a caught-up voting member")]
    JoinTimeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Replication(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
