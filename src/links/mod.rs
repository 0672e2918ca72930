//! Link registry.
//!
//! [`Links`] caches one link per partition key plus a single management
//! link, creates them on first use and tears down exactly what a failure
//! requires.
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
//! senders
//!     .retry(&cancel, &PartitionKey::new("0"), "send", &RetryOptions::default(), |handle| {
//!         let cancel = cancel.clone();
//!         async move { handle.link().send(&cancel, Message::new(b"reading".as_slice())).await }
//!     })
//!     .await?;
//!
//! senders.close(&cancel).await?;
//! # Ok(())
//! # }
//! ```

mod factory;
mod registry;

pub use factory::{
    receiver_entity_path, sender_entity_path, LinkFactory, ReceiverFactory, SenderFactory,
    DEFAULT_PREFETCH,
};
pub use registry::{LinkHandle, Links};
