//! Transport capabilities consumed by the connection and link managers.
//!
//! Everything above this module depends only on these traits: open a
//! connection, open a session on it, open sender/receiver links on the
//! session. Any of them may fail or be closed by the peer at any time.
//!
//! [`memory`] provides an in-process broker implementing the traits, with
//! hooks for injecting detaches, dropped connections and slow closes.
//!
//! # Example
//!
//! ```no_run
//! use hublink::transport::memory::MemoryBroker;
//! use hublink::transport::{Connector, LinkOptions};
//! use hublink::Message;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> hublink::Result<()> {
//! let broker = MemoryBroker::new();
//! let cancel = CancellationToken::new();
//!
//! let conn = broker.open_connection().await?;
//! let session = conn.open_session(&cancel).await?;
//! let sender = session
//!     .open_sender(&cancel, "hub/Partitions/0", LinkOptions::default())
//!     .await?;
//!
//! sender.send(&cancel, Message::new(b"hello".as_slice())).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::message::Message;

/// Shared handle to an open connection.
pub type ConnectionPtr = Arc<dyn AmqpConnection>;

/// Shared handle to an open session.
pub type SessionPtr = Arc<dyn AmqpSession>;

/// Boxed sender link.
pub type SenderPtr = Box<dyn SenderLink>;

/// Boxed receiver link.
pub type ReceiverPtr = Box<dyn ReceiverLink>;

/// Options used when attaching a link.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Explicit link name. The transport picks a unique one when `None`.
    pub name: Option<String>,
    /// Target address for receivers whose replies go to a private address.
    pub target_address: Option<String>,
    /// Credit issued as soon as a receiver attaches.
    pub initial_credit: u32,
}

impl LinkOptions {
    /// Set the link name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the target address.
    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }

    /// Set the initial credit.
    pub fn with_initial_credit(mut self, credit: u32) -> Self {
        self.initial_credit = credit;
        self
    }
}

/// Capabilities shared by every kind of link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Stable name of the link. Used instead of object identity to tell
    /// whether a handle still refers to the live link.
    fn name(&self) -> &str;

    /// Detach and close the link.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl<T: Link + ?Sized> Link for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).close(cancel).await
    }
}

#[async_trait]
impl<T: Link + ?Sized> Link for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).close(cancel).await
    }
}

/// A link that sends messages to an address.
#[async_trait]
pub trait SenderLink: Link {
    /// Send a message and wait for the broker to settle it.
    async fn send(&self, cancel: &CancellationToken, message: Message) -> Result<()>;
}

/// A link that receives messages from an address.
#[async_trait]
pub trait ReceiverLink: Link {
    /// Wait for the next message. Consumes one credit on success.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Message>;

    /// Grant the peer `credit` more messages.
    fn issue_credit(&self, credit: u32) -> Result<()>;

    /// Credit currently outstanding.
    fn credits(&self) -> u32;
}

/// A session: a group of links within a connection.
#[async_trait]
pub trait AmqpSession: Send + Sync {
    /// Attach a sender link to `address`.
    async fn open_sender(
        &self,
        cancel: &CancellationToken,
        address: &str,
        options: LinkOptions,
    ) -> Result<SenderPtr>;

    /// Attach a receiver link reading from `source`.
    async fn open_receiver(
        &self,
        cancel: &CancellationToken,
        source: &str,
        options: LinkOptions,
    ) -> Result<ReceiverPtr>;

    /// End the session.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;
}

/// A physical connection to the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Begin a new session.
    async fn open_session(&self, cancel: &CancellationToken) -> Result<SessionPtr>;

    /// Close the connection and everything on it.
    async fn close(&self) -> Result<()>;
}

/// Factory for physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to the broker.
    async fn open_connection(&self) -> Result<ConnectionPtr>;
}

/// Run a cleanup future with its own time limit.
///
/// The close is given priority over `cancel`: a close that is ready
/// completes even if the caller already gave up. A close that is still
/// pending when `cancel` fires returns [`HubError::Cancelled`]; one that
/// outlives `limit` returns [`HubError::ConnResetNeeded`], since the
/// peer's view of the link is then unknown.
pub async fn close_bounded<F>(cancel: &CancellationToken, limit: Duration, close: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        res = tokio::time::timeout(limit, close) => match res {
            Ok(res) => res,
            Err(_) => Err(HubError::ConnResetNeeded),
        },
        _ = cancel.cancelled() => Err(HubError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_bounded_ok() {
        let cancel = CancellationToken::new();
        let res = close_bounded(&cancel, Duration::from_secs(1), async { Ok(()) }).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_close_bounded_ready_close_wins_over_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = close_bounded(&cancel, Duration::from_secs(1), async { Ok(()) }).await;
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_bounded_timeout_needs_reset() {
        let cancel = CancellationToken::new();
        let res = close_bounded(&cancel, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(HubError::ConnResetNeeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_bounded_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let res = close_bounded(&cancel, Duration::from_secs(60), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(HubError::Cancelled)));
    }
}
