//! Connection management.
//!
//! This module provides:
//! - [`Namespace`], the owner of the single versioned connection
//! - Background claim renewal ([`ClaimRenewal`])
//! - Configuration for retries, close timeouts and claim refresh
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use hublink::connection::{ClientOptions, Namespace, RetryOptions};
//! use hublink::credential::{AccessToken, StaticTokenCredential};
//! use hublink::transport::memory::MemoryBroker;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> hublink::Result<()> {
//! let options = ClientOptions::new("my-ns.servicebus.windows.net")
//!     .with_retry(RetryOptions::default().with_max_retries(5))
//!     .with_close_timeout(Duration::from_secs(10));
//!
//! let ns = Arc::new(Namespace::new(
//!     MemoryBroker::new(),
//!     StaticTokenCredential::new(AccessToken::sas("SharedAccessSignature sr=...")),
//!     options,
//! ));
//!
//! let cancel = CancellationToken::new();
//! let (_conn, version) = ns.get_connection(&cancel).await?;
//!
//! // after a connection-scoped failure, only the first caller that saw
//! // `version` actually replaces the connection
//! ns.recover(&cancel, version).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod namespace;
mod state;

pub use config::{ClaimRefreshBounds, ClientOptions, RetryOptions};
pub use namespace::{ClaimRenewal, Namespace};
pub use state::NamespaceStats;
