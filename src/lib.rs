//! Connection and link lifecycle management for partitioned event hubs.
//!
//! This crate keeps the expensive, stateful pieces of an AMQP client
//! alive and authenticated: one physical connection, one management link,
//! and one sender or receiver link per partition. When something fails it
//! tears down only what the failure requires, then retries.
//!
//! # Features
//!
//! - Versioned connection, recreated at most once per observed failure
//! - Claim-based authentication with background renewal
//! - Per-partition link cache with stale-handle detection
//! - Error classification into recovery scopes, with an overridable table
//! - Retry loop with exponential backoff and a quick retry after detaches
//! - In-memory broker with fault injection for tests
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hublink::connection::{ClientOptions, Namespace, RetryOptions};
//! use hublink::credential::{AccessToken, StaticTokenCredential};
//! use hublink::links::Links;
//! use hublink::transport::memory::MemoryBroker;
//! use hublink::transport::SenderLink;
//! use hublink::{Message, PartitionKey};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> hublink::Result<()> {
//! let ns = Arc::new(Namespace::new(
//!     MemoryBroker::new(),
//!     StaticTokenCredential::new(AccessToken::sas("SharedAccessSignature sr=...")),
//!     ClientOptions::new("my-ns.servicebus.windows.net"),
//! ));
//! let senders = Links::senders(ns, "telemetry");
//! let cancel = CancellationToken::new();
//!
//! // the link is created on first use and recovered on failure
//! senders
//!     .retry(&cancel, &PartitionKey::new("0"), "send", &RetryOptions::default(), |handle| {
//!         let cancel = cancel.clone();
//!         async move { handle.link().send(&cancel, Message::new(b"hello".as_slice())).await }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Recovery scopes
//!
//! ```text
//! error ──classify──► None        retry as is
//!                     Link        evict + close one link, retry
//!                     Connection  recover connection at the handle's
//!                                 version, evict every link, retry
//!                     Fatal       return the error
//! ```

pub mod cbs;
pub mod connection;
pub mod credential;
pub mod error;
pub mod links;
pub mod message;
pub mod recovery;
pub mod retry;
pub mod rpc;
pub mod transport;
pub mod types;

// Re-export commonly used types at the crate root
pub use connection::{ClientOptions, Namespace, RetryOptions};
pub use error::{HubError, Result};
pub use links::{LinkHandle, Links};
pub use message::{Message, MessageBuilder, PropertyValue};
pub use recovery::{classify, is_quick_recovery_error, RecoveryKind, RecoveryPolicy};
pub use types::{Condition, ConnectionVersion, PartitionKey, CBS_ADDRESS, MANAGEMENT_ADDRESS};
