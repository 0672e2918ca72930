//! Classification of failures into recovery scopes.
//!
//! [`RecoveryPolicy::classify`] maps an error to the smallest set of
//! resources that must be rebuilt before retrying:
//!
//! ```text
//! None        retry as is, cached resources are fine
//! Link        close and evict the one link that failed
//! Connection  close the connection and every link created on it
//! Fatal       don't retry, don't touch anything
//! ```
//!
//! The condition table is a tuned policy rather than a closed set; use
//! [`RecoveryPolicy::with_condition`] to override or extend it.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::HubError;
use crate::types::Condition;

/// Blast radius of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryKind {
    /// Transient; retry without resource action.
    None,
    /// The specific link is suspect.
    Link,
    /// The physical connection is suspect.
    Connection,
    /// Not retriable.
    Fatal,
}

/// Maps errors to [`RecoveryKind`]s.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    conditions: HashMap<Condition, RecoveryKind>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        let conditions = [
            (Condition::SERVER_BUSY, RecoveryKind::None),
            (Condition::TIMEOUT, RecoveryKind::None),
            (Condition::OPERATION_CANCELLED, RecoveryKind::None),
            (Condition::DETACH_FORCED, RecoveryKind::Link),
            (Condition::TRANSFER_LIMIT_EXCEEDED, RecoveryKind::Link),
            (Condition::CONNECTION_FORCED, RecoveryKind::Connection),
            (Condition::INTERNAL_ERROR, RecoveryKind::Connection),
            // escalated so a clean connection is used even though neither
            // the session nor the link reported closed
            (Condition::NOT_IMPLEMENTED, RecoveryKind::Connection),
            (Condition::UNAUTHORIZED_ACCESS, RecoveryKind::Fatal),
            (Condition::NOT_ALLOWED, RecoveryKind::Fatal),
            (Condition::NOT_FOUND, RecoveryKind::Fatal),
            (Condition::RESOURCE_LIMIT_EXCEEDED, RecoveryKind::Fatal),
            (Condition::MESSAGE_SIZE_EXCEEDED, RecoveryKind::Fatal),
            (Condition::ENTITY_DISABLED, RecoveryKind::Fatal),
            (Condition::LINK_STOLEN, RecoveryKind::Fatal),
        ];
        Self {
            conditions: conditions.into_iter().collect(),
        }
    }
}

impl RecoveryPolicy {
    /// Policy with an empty condition table.
    pub fn empty() -> Self {
        Self {
            conditions: HashMap::new(),
        }
    }

    /// Override how a condition is classified.
    pub fn with_condition(mut self, condition: Condition, kind: RecoveryKind) -> Self {
        self.conditions.insert(condition, kind);
        self
    }

    /// Look up a condition in the table.
    pub fn condition_kind(&self, condition: &Condition) -> Option<RecoveryKind> {
        self.conditions.get(condition).copied()
    }

    /// Classify an error.
    pub fn classify(&self, err: &HubError) -> RecoveryKind {
        match err {
            HubError::Detached { condition, .. } => condition
                .as_ref()
                .and_then(|c| self.condition_kind(c))
                .unwrap_or(RecoveryKind::Link),
            HubError::LinkClosed(_) => RecoveryKind::Link,
            HubError::SessionClosed(_)
            | HubError::ConnectionClosed(_)
            | HubError::ConnResetNeeded
            | HubError::Io(_) => RecoveryKind::Connection,
            HubError::Protocol { condition, .. } => {
                self.condition_kind(condition).unwrap_or(RecoveryKind::None)
            }
            HubError::Rpc { status_code, .. } => match status_code {
                401 | 403 | 404 => RecoveryKind::Fatal,
                _ => RecoveryKind::None,
            },
            HubError::Auth { .. }
            | HubError::Credential(_)
            | HubError::NonRetriable(_)
            | HubError::Cancelled
            | HubError::ClientClosed => RecoveryKind::Fatal,
            HubError::Timeout | HubError::InvalidResponse(_) => RecoveryKind::None,
        }
    }

    /// Check if an error qualifies for one immediate retry.
    ///
    /// Detaches are processed asynchronously by the transport, so the
    /// error often surfaces on the first use after the link already died.
    pub fn is_quick_recovery_error(&self, err: &HubError) -> bool {
        matches!(err, HubError::Detached { .. }) && self.classify(err) == RecoveryKind::Link
    }
}

static DEFAULT_POLICY: LazyLock<RecoveryPolicy> = LazyLock::new(RecoveryPolicy::default);

/// Classify an error with the default policy.
pub fn classify(err: &HubError) -> RecoveryKind {
    DEFAULT_POLICY.classify(err)
}

/// [`RecoveryPolicy::is_quick_recovery_error`] with the default policy.
pub fn is_quick_recovery_error(err: &HubError) -> bool {
    DEFAULT_POLICY.is_quick_recovery_error(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_link_scoped_errors() {
        assert_eq!(
            classify(&HubError::detached("l", Some(Condition::DETACH_FORCED), "")),
            RecoveryKind::Link
        );
        assert_eq!(classify(&HubError::detached("l", None, "")), RecoveryKind::Link);
        assert_eq!(classify(&HubError::LinkClosed("l".into())), RecoveryKind::Link);
    }

    #[test]
    fn test_connection_scoped_errors() {
        assert_eq!(
            classify(&HubError::SessionClosed("ended".into())),
            RecoveryKind::Connection
        );
        assert_eq!(
            classify(&HubError::ConnectionClosed("reset".into())),
            RecoveryKind::Connection
        );
        assert_eq!(classify(&HubError::ConnResetNeeded), RecoveryKind::Connection);
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::ConnectionReset).into()),
            RecoveryKind::Connection
        );
        assert_eq!(
            classify(&HubError::protocol(Condition::NOT_IMPLEMENTED, "")),
            RecoveryKind::Connection
        );
    }

    #[test]
    fn test_fatal_errors() {
        let auth = HubError::Auth {
            status_code: 401,
            description: "InvalidSignature".into(),
        };
        assert_eq!(classify(&auth), RecoveryKind::Fatal);
        assert_eq!(
            classify(&HubError::protocol(Condition::UNAUTHORIZED_ACCESS, "")),
            RecoveryKind::Fatal
        );
        // a detach whose condition is itself fatal stays fatal
        assert_eq!(
            classify(&HubError::detached("l", Some(Condition::LINK_STOLEN), "")),
            RecoveryKind::Fatal
        );
        assert_eq!(classify(&HubError::Cancelled), RecoveryKind::Fatal);
        assert_eq!(classify(&HubError::ClientClosed), RecoveryKind::Fatal);
    }

    #[test]
    fn test_transient_errors() {
        assert_eq!(classify(&HubError::Timeout), RecoveryKind::None);
        assert_eq!(
            classify(&HubError::protocol(Condition::SERVER_BUSY, "")),
            RecoveryKind::None
        );
        assert_eq!(
            classify(&HubError::protocol(Condition::new("vendor:unknown"), "")),
            RecoveryKind::None
        );
        let rpc = HubError::Rpc {
            status_code: 503,
            description: "busy".into(),
        };
        assert_eq!(classify(&rpc), RecoveryKind::None);
    }

    #[test]
    fn test_policy_override() {
        let policy = RecoveryPolicy::default()
            .with_condition(Condition::NOT_IMPLEMENTED, RecoveryKind::None)
            .with_condition(Condition::new("vendor:quota"), RecoveryKind::Fatal);

        assert_eq!(
            policy.classify(&HubError::protocol(Condition::NOT_IMPLEMENTED, "")),
            RecoveryKind::None
        );
        assert_eq!(
            policy.classify(&HubError::protocol(Condition::new("vendor:quota"), "")),
            RecoveryKind::Fatal
        );
        assert_eq!(
            RecoveryPolicy::empty().classify(&HubError::protocol(Condition::SERVER_BUSY, "")),
            RecoveryKind::None
        );
    }

    #[test]
    fn test_quick_recovery() {
        assert!(is_quick_recovery_error(&HubError::detached(
            "l",
            Some(Condition::DETACH_FORCED),
            ""
        )));
        assert!(!is_quick_recovery_error(&HubError::detached(
            "l",
            Some(Condition::LINK_STOLEN),
            ""
        )));
        assert!(!is_quick_recovery_error(&HubError::LinkClosed("l".into())));
        assert!(!is_quick_recovery_error(&HubError::ConnResetNeeded));
    }
}
