//! Connection Layer Error Types
//!
//! Core error types shared by every transport variant.

use thiserror::Error;

/// Result type for devlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Connection layer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Send attempted without an open connection
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Send called without payload data
    #[error("Empty payload: send requires a non-empty payload")]
    EmptyPayload,

    /// Payload could not be coerced for the transport
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Opening the transport failed
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// Writing to the transport failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Reading from the transport failed with something other than a timeout
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Remote answered with a non-2xx/3xx status
    #[error("HTTP request returned status {status}: {message}")]
    Http { status: u16, message: String },

    /// HTTP request failed before a status was received
    #[error("Request failed: {0}")]
    Request(String),

    /// Received bytes could not be decoded as text
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Config(format!("JSON error: {}", err))
    }
}

impl From<figment::Error> for LinkError {
    fn from(err: figment::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => LinkError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => LinkError::Request(err.to_string()),
        }
    }
}

impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::InvalidInput => LinkError::Config(err.to_string()),
            _ => LinkError::OpenFailed(err.to_string()),
        }
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn not_connected(msg: impl Into<String>) -> Self {
        LinkError::NotConnected(msg.into())
    }

    pub fn open_failed(msg: impl Into<String>) -> Self {
        LinkError::OpenFailed(msg.into())
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        LinkError::WriteFailed(msg.into())
    }

    pub fn read_failed(msg: impl Into<String>) -> Self {
        LinkError::ReadFailed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        LinkError::Decode(msg.into())
    }

    /// Errors that must not be retried by an open loop
    pub fn is_fatal_open_error(&self) -> bool {
        matches!(self, LinkError::Config(_) | LinkError::InvalidPayload(_))
    }
}
