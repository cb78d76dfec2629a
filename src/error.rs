//! Error handling for the location service
//!
//! One error type shared by all components, with conversions from the
//! library errors that cross component boundaries.

use thiserror::Error;

/// Location Service Error Type
#[derive(Error, Debug)]
pub enum LocSrvError {
    /// Configuration-related errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol errors (framing, encoding)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal bus errors (endpoint gone, handshake failure)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Event store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Geolocation lookup errors (no match, backend failure)
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// Operator command errors (unknown or ambiguous command, bad value)
    #[error("Command error: {0}")]
    Command(String),
}

/// Result type alias for the location service
pub type Result<T> = std::result::Result<T, LocSrvError>;

impl From<serde_json::Error> for LocSrvError {
    fn from(err: serde_json::Error) -> Self {
        LocSrvError::Serialization(format!("JSON error: {err}"))
    }
}

impl From<figment::Error> for LocSrvError {
    fn from(err: figment::Error) -> Self {
        LocSrvError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for LocSrvError {
    fn from(err: reqwest::Error) -> Self {
        LocSrvError::Lookup(err.to_string())
    }
}

impl LocSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        LocSrvError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LocSrvError::Protocol(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        LocSrvError::Bus(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        LocSrvError::Lookup(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        LocSrvError::Command(msg.into())
    }
}
