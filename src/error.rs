//! repguard Error Types

use thiserror::Error;

use crate::registry::NodeId;

/// Result type alias for repguard operations
pub type Result<T> = std::result::Result<T, Error>;

/// repguard error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Registry / database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("No active primary registered")]
    NoPrimary,

    // Structural invariant violations
    #[error("Upstream node id cannot be the same as the local node id ({0})")]
    InvalidUpstream(NodeId),

    #[error("Local node id has not been established")]
    NotInitialised,

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unexpected response from {peer}: {message}")]
    Protocol { peer: String, message: String },

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Daemon lifecycle errors
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Degraded monitoring timeout of {0}s exceeded")]
    DegradedTimeout(u64),

    #[error("Daemon already running with pid {0}")]
    AlreadyRunning(u32),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient peer condition (counts as an abstention)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Database(_)
        )
    }

    /// Check if this error is a structural invariant violation
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::InvalidUpstream(_) | Error::NotInitialised)
    }
}
