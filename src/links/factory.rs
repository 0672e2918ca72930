//! How the registry turns a partition key into a link.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::transport::{LinkOptions, ReceiverPtr, SenderPtr, SessionPtr};
use crate::types::PartitionKey;

/// Prefetch used by [`ReceiverFactory`] unless overridden.
pub const DEFAULT_PREFETCH: u32 = 300;

/// Creates the links cached by a [`Links`](super::Links) registry.
#[async_trait]
pub trait LinkFactory<L: Send>: Send + Sync {
    /// Entity path the link for `partition` is authenticated for.
    fn entity_path(&self, partition: &PartitionKey) -> String;

    /// Attach the link for `partition` on `session`.
    async fn create_link(
        &self,
        cancel: &CancellationToken,
        session: &SessionPtr,
        partition: &PartitionKey,
    ) -> Result<L>;
}

/// Sender path for a partition of `hub`.
pub fn sender_entity_path(hub: &str, partition: &PartitionKey) -> String {
    format!("{hub}/Partitions/{partition}")
}

/// Receiver path for a partition of `hub` read through `consumer_group`.
pub fn receiver_entity_path(hub: &str, consumer_group: &str, partition: &PartitionKey) -> String {
    format!("{hub}/ConsumerGroups/{consumer_group}/Partitions/{partition}")
}

/// Opens one sender per partition.
#[derive(Debug, Clone)]
pub struct SenderFactory {
    hub: String,
}

impl SenderFactory {
    /// Senders for the partitions of `hub`.
    pub fn new(hub: impl Into<String>) -> Self {
        Self { hub: hub.into() }
    }
}

#[async_trait]
impl LinkFactory<SenderPtr> for SenderFactory {
    fn entity_path(&self, partition: &PartitionKey) -> String {
        sender_entity_path(&self.hub, partition)
    }

    async fn create_link(
        &self,
        cancel: &CancellationToken,
        session: &SessionPtr,
        partition: &PartitionKey,
    ) -> Result<SenderPtr> {
        session
            .open_sender(cancel, &self.entity_path(partition), LinkOptions::default())
            .await
    }
}

/// Opens one receiver per partition with credit issued up front.
#[derive(Debug, Clone)]
pub struct ReceiverFactory {
    hub: String,
    consumer_group: String,
    prefetch: u32,
}

impl ReceiverFactory {
    /// Receivers for the partitions of `hub` in `consumer_group`.
    pub fn new(hub: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            consumer_group: consumer_group.into(),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Set the credit issued when a receiver attaches.
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }
}

#[async_trait]
impl LinkFactory<ReceiverPtr> for ReceiverFactory {
    fn entity_path(&self, partition: &PartitionKey) -> String {
        receiver_entity_path(&self.hub, &self.consumer_group, partition)
    }

    async fn create_link(
        &self,
        cancel: &CancellationToken,
        session: &SessionPtr,
        partition: &PartitionKey,
    ) -> Result<ReceiverPtr> {
        session
            .open_receiver(
                cancel,
                &self.entity_path(partition),
                LinkOptions::default().with_initial_credit(self.prefetch),
            )
            .await
    }
}
