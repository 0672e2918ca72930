//! Error types for connection, session and link operations.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::types::Condition;

/// Errors that can occur while talking to the broker.
///
/// Every variant is cheap to clone so a retry loop can hand the last
/// failure back to the caller unchanged.
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer detached the link.
    #[error("link {link_name} detached by peer: {description}")]
    Detached {
        link_name: String,
        condition: Option<Condition>,
        description: String,
    },

    /// The link object is closed and can no longer be used.
    #[error("link {0} is closed")]
    LinkClosed(String),

    /// The session carrying the link ended.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The physical connection ended.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Protocol error carrying a condition code.
    #[error("protocol error {condition}: {description}")]
    Protocol {
        condition: Condition,
        description: String,
    },

    /// The broker rejected a claim (token) for an audience.
    #[error("claim negotiation failed with status {status_code}: {description}")]
    Auth { status_code: u16, description: String },

    /// A management request came back with a non-success status.
    #[error("management request failed with status {status_code}: {description}")]
    Rpc { status_code: u16, description: String },

    /// The token provider failed.
    #[error("credential error: {0}")]
    Credential(String),

    /// Explicitly marked as not worth retrying.
    #[error("non-retriable error: {0}")]
    NonRetriable(String),

    /// Cleanup did not complete; link and connection state can't be trusted.
    #[error("connection must be reset, link/connection state may be inconsistent")]
    ConnResetNeeded,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The client was closed permanently.
    #[error("client has been closed")]
    ClientClosed,

    /// A response could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

impl From<io::Error> for HubError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl HubError {
    /// Create a detach error for the given link.
    pub fn detached(
        link_name: impl Into<String>,
        condition: Option<Condition>,
        description: impl Into<String>,
    ) -> Self {
        Self::Detached {
            link_name: link_name.into(),
            condition,
            description: description.into(),
        }
    }

    /// Create a protocol error with a condition code.
    pub fn protocol(condition: Condition, description: impl Into<String>) -> Self {
        Self::Protocol {
            condition,
            description: description.into(),
        }
    }

    /// The condition code attached to this error, if any.
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Self::Detached { condition, .. } => condition.as_ref(),
            Self::Protocol { condition, .. } => Some(condition),
            _ => None,
        }
    }

    /// Check if this error came from the caller cancelling.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HubError::Auth {
            status_code: 401,
            description: "InvalidSignature".into(),
        };
        assert_eq!(
            format!("{err}"),
            "claim negotiation failed with status 401: InvalidSignature"
        );

        let err = HubError::detached("sender-1", Some(Condition::DETACH_FORCED), "idle");
        assert_eq!(format!("{err}"), "link sender-1 detached by peer: idle");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "test");
        let err: HubError = io_err.into();
        assert!(matches!(err, HubError::Io(_)));

        // clones share the same underlying io::Error
        let cloned = err.clone();
        assert_eq!(format!("{err}"), format!("{cloned}"));
    }

    #[test]
    fn test_condition_accessor() {
        let err = HubError::protocol(Condition::SERVER_BUSY, "busy");
        assert_eq!(err.condition(), Some(&Condition::SERVER_BUSY));
        assert_eq!(HubError::Timeout.condition(), None);
        assert!(HubError::Cancelled.is_cancelled());
    }
}
