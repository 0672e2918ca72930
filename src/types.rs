//! Core identifiers and protocol constants.

use std::borrow::Cow;
use std::fmt;

/// Address of the claims-based security node.
pub const CBS_ADDRESS: &str = "$cbs";

/// Address of the management node.
pub const MANAGEMENT_ADDRESS: &str = "$management";

/// Identifies one physical-connection instance.
///
/// Incremented once per successful connection (re)creation and never
/// reused, so comparing versions tells whether a handle is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionVersion(pub u64);

impl ConnectionVersion {
    /// The version that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConnectionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Key under which a link is cached, normally a partition id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(pub String);

impl PartitionKey {
    /// Create a key from anything string-like.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Symbolic error condition carried by protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition(Cow<'static, str>);

impl Condition {
    /// Peer forcibly detached the link.
    pub const DETACH_FORCED: Condition = Condition(Cow::Borrowed("amqp:link:detach-forced"));
    /// Transfer limit on the link was exceeded.
    pub const TRANSFER_LIMIT_EXCEEDED: Condition =
        Condition(Cow::Borrowed("amqp:link:transfer-limit-exceeded"));
    /// Another receiver with a higher owner level took the link.
    pub const LINK_STOLEN: Condition = Condition(Cow::Borrowed("amqp:link:stolen"));
    /// Message exceeded the maximum size.
    pub const MESSAGE_SIZE_EXCEEDED: Condition =
        Condition(Cow::Borrowed("amqp:link:message-size-exceeded"));
    /// Peer forcibly closed the connection.
    pub const CONNECTION_FORCED: Condition = Condition(Cow::Borrowed("amqp:connection:forced"));
    /// Internal error on the broker.
    pub const INTERNAL_ERROR: Condition = Condition(Cow::Borrowed("amqp:internal-error"));
    /// Requested feature is not implemented by the peer.
    pub const NOT_IMPLEMENTED: Condition = Condition(Cow::Borrowed("amqp:not-implemented"));
    /// The client is not authorized.
    pub const UNAUTHORIZED_ACCESS: Condition =
        Condition(Cow::Borrowed("amqp:unauthorized-access"));
    /// The operation is not allowed.
    pub const NOT_ALLOWED: Condition = Condition(Cow::Borrowed("amqp:not-allowed"));
    /// The entity does not exist.
    pub const NOT_FOUND: Condition = Condition(Cow::Borrowed("amqp:not-found"));
    /// A broker quota was hit.
    pub const RESOURCE_LIMIT_EXCEEDED: Condition =
        Condition(Cow::Borrowed("amqp:resource-limit-exceeded"));
    /// Broker is temporarily overloaded.
    pub const SERVER_BUSY: Condition = Condition(Cow::Borrowed("com.microsoft:server-busy"));
    /// Broker-side timeout.
    pub const TIMEOUT: Condition = Condition(Cow::Borrowed("com.microsoft:timeout"));
    /// Broker cancelled the operation.
    pub const OPERATION_CANCELLED: Condition =
        Condition(Cow::Borrowed("com.microsoft:operation-cancelled"));
    /// The entity is disabled.
    pub const ENTITY_DISABLED: Condition =
        Condition(Cow::Borrowed("com.microsoft:entity-disabled"));

    /// Create a condition from an arbitrary symbol.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(Cow::Owned(symbol.into()))
    }

    /// The condition symbol.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check if an RPC status code indicates success (2xx).
pub fn is_success_status(code: u16) -> bool {
    (200..300).contains(&code)
}
