use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How a session reacts when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed, truncated or unsupported frame: reply `protocolError`.
    Protocol,
    /// Storage unavailable: reply `retryReportError`.
    Persistence,
    /// Peer went away or stalled: no reply is possible.
    Transport,
    /// Only raised during startup.
    Fatal,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::Database(_) | Error::Migration(_) | Error::Storage(_) => ErrorClass::Persistence,
            Error::Timeout(_) | Error::Io(_) => ErrorClass::Transport,
            Error::Json(_) | Error::Config(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::protocol("bad tag").class(), ErrorClass::Protocol);
        assert_eq!(
            Error::Timeout(Duration::from_secs(60)).class(),
            ErrorClass::Transport
        );
        assert_eq!(
            Error::Database(sqlx::Error::PoolTimedOut).class(),
            ErrorClass::Persistence
        );
        assert_eq!(
            Error::Storage("offline".to_string()).class(),
            ErrorClass::Persistence
        );
        assert_eq!(Error::Config("x".to_string()).class(), ErrorClass::Fatal);
    }
}
