//! Session error taxonomy
//!
//! Every failure the core reports maps onto one [`ErrorKind`]. The kind is the
//! stable, machine-readable part; the cause string is diagnostic text taken from
//! the failing layer and is not meant to be shown to users verbatim.

use std::fmt;
use thiserror::Error;

/// Stable error codes exposed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AdapterNotReady,
    PermissionDenied,
    ScanError,
    ConnectError,
    EnumerationError,
    NotConnected,
    InvalidTarget,
    WriteError,
    EncodingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdapterNotReady => "adapter_not_ready",
            Self::PermissionDenied => "permission_denied",
            Self::ScanError => "scan_error",
            Self::ConnectError => "connect_error",
            Self::EnumerationError => "enumeration_error",
            Self::NotConnected => "not_connected",
            Self::InvalidTarget => "invalid_target",
            Self::WriteError => "write_error",
            Self::EncodingError => "encoding_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every fallible session operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth adapter not ready: {0}")]
    AdapterNotReady(String),

    #[error("Bluetooth scan permission denied: {0}")]
    PermissionDenied(String),

    #[error("Scan failed: {0}")]
    ScanError(String),

    #[error("Connection failed: {0}")]
    ConnectError(String),

    #[error("GATT enumeration failed: {0}")]
    EnumerationError(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Invalid command target: {0}")]
    InvalidTarget(String),

    #[error("Characteristic write failed: {0}")]
    WriteError(String),

    #[error("Payload encoding failed: {0}")]
    EncodingError(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdapterNotReady(_) => ErrorKind::AdapterNotReady,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::ScanError(_) => ErrorKind::ScanError,
            Self::ConnectError(_) => ErrorKind::ConnectError,
            Self::EnumerationError(_) => ErrorKind::EnumerationError,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::InvalidTarget(_) => ErrorKind::InvalidTarget,
            Self::WriteError(_) => ErrorKind::WriteError,
            Self::EncodingError(_) => ErrorKind::EncodingError,
        }
    }

    /// Underlying cause as reported by the failing layer
    pub fn cause(&self) -> &str {
        match self {
            Self::AdapterNotReady(cause)
            | Self::PermissionDenied(cause)
            | Self::ScanError(cause)
            | Self::ConnectError(cause)
            | Self::EnumerationError(cause)
            | Self::NotConnected(cause)
            | Self::InvalidTarget(cause)
            | Self::WriteError(cause)
            | Self::EncodingError(cause) => cause,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
