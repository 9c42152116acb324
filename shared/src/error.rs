//! Error taxonomy for the link
//!
//! Three layers of failure are kept apart:
//! - [`DeviceError`] is whatever the transport reports, tagged with a
//!   [`DeviceErrorKind`];
//! - [`SessionError`] is a terminal failure of the connection session, seen by
//!   every subscriber of the connection feed;
//! - [`OperationError`] is local to one read or write call.
//!
//! [`classify`] decides which device errors the session absorbs by reconnecting.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kind of failure reported by a device backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// The physical link dropped unexpectedly
    Disconnected,
    /// An operation was issued on a connection that is no longer live
    NotConnected,
    /// The peripheral does not expose the requested characteristic
    CharacteristicNotFound,
    /// The peripheral refused the read or write
    Rejected,
    /// The radio stack refused access (authorization, permissions)
    PermissionDenied,
    /// No usable adapter (powered off, missing, unsupported)
    AdapterUnavailable,
    /// The transport gave up waiting for the peripheral
    Timeout,
    /// Any other transport failure
    Transport,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceErrorKind::Disconnected => "disconnected",
            DeviceErrorKind::NotConnected => "not connected",
            DeviceErrorKind::CharacteristicNotFound => "characteristic not found",
            DeviceErrorKind::Rejected => "rejected",
            DeviceErrorKind::PermissionDenied => "permission denied",
            DeviceErrorKind::AdapterUnavailable => "adapter unavailable",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Transport => "transport error",
        };
        f.write_str(name)
    }
}

/// Failure reported by a device backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Link dropped unexpectedly
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Disconnected, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::NotConnected, message)
    }
}

/// How the session treats a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable by reconnecting; never surfaced to feed subscribers
    TransientDisconnect,
    /// Terminates the session and reaches every subscriber
    Fatal,
}

/// Default retry classification: only an unexpected link drop is retried.
pub fn classify(error: &DeviceError) -> ErrorClass {
    match error.kind {
        DeviceErrorKind::Disconnected => ErrorClass::TransientDisconnect,
        _ => ErrorClass::Fatal,
    }
}

/// Terminal failure of a connection session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Fatal(DeviceError),

    #[error("Gave up reconnecting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DeviceError },
}

/// Failure of a single characteristic read or write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Session failed before a connection was available: {0}")]
    SessionFailed(#[from] SessionError),

    #[error("Session was dropped")]
    SessionDropped,

    #[error("Operation rejected: {0}")]
    Rejected(DeviceError),

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disconnect_is_transient() {
        assert_eq!(
            classify(&DeviceError::disconnected("link lost")),
            ErrorClass::TransientDisconnect
        );

        for kind in [
            DeviceErrorKind::NotConnected,
            DeviceErrorKind::CharacteristicNotFound,
            DeviceErrorKind::Rejected,
            DeviceErrorKind::PermissionDenied,
            DeviceErrorKind::AdapterUnavailable,
            DeviceErrorKind::Timeout,
            DeviceErrorKind::Transport,
        ] {
            assert_eq!(classify(&DeviceError::new(kind, "x")), ErrorClass::Fatal, "{kind}");
        }
    }

    #[test]
    fn test_error_messages() {
        let err = DeviceError::new(DeviceErrorKind::PermissionDenied, "bluetooth off");
        assert_eq!(err.to_string(), "permission denied: bluetooth off");

        let session = SessionError::RetriesExhausted {
            attempts: 3,
            last: DeviceError::disconnected("gone"),
        };
        assert_eq!(
            session.to_string(),
            "Gave up reconnecting after 3 attempts: disconnected: gone"
        );

        let op: OperationError = SessionError::Fatal(err).into();
        assert!(matches!(op, OperationError::SessionFailed(_)));
    }
}
