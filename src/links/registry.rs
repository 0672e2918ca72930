//! The per-partition link cache and its recovery logic.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::connection::{ClaimRenewal, Namespace, RetryOptions};
use crate::error::{HubError, Result};
use crate::message::Message;
use crate::recovery::{RecoveryKind, RecoveryPolicy};
use crate::rpc::{RpcLink, RpcResponse};
use crate::transport::{close_bounded, ConnectionPtr, Link, ReceiverPtr, SenderPtr, SessionPtr};
use crate::types::{ConnectionVersion, PartitionKey, MANAGEMENT_ADDRESS};

use super::factory::{LinkFactory, ReceiverFactory, SenderFactory};

/// Snapshot of a cached link.
///
/// Holding a handle doesn't keep the link in the registry; after a
/// recovery it may refer to a closed link. Pass it back to
/// [`Links::recover_if_needed`] together with the error it produced.
pub struct LinkHandle<L> {
    version: ConnectionVersion,
    partition: PartitionKey,
    link: Arc<L>,
}

impl<L> Clone for LinkHandle<L> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            partition: self.partition.clone(),
            link: Arc::clone(&self.link),
        }
    }
}

impl<L: Link> LinkHandle<L> {
    /// Version of the connection the link was created on.
    pub fn version(&self) -> ConnectionVersion {
        self.version
    }

    /// Key the link is cached under.
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// The link itself.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Name of the link.
    pub fn name(&self) -> &str {
        self.link.name()
    }
}

impl<L: Link> fmt::Debug for LinkHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("version", &self.version)
            .field("partition", &self.partition)
            .field("link", &self.link.name())
            .finish()
    }
}

/// A cached link and everything that lives and dies with it.
struct LinkState<L> {
    version: ConnectionVersion,
    link: Arc<L>,
    /// Session created for the link, if the link doesn't own it.
    session: Option<SessionPtr>,
    renewal: ClaimRenewal,
}

impl<L: Link> LinkState<L> {
    fn handle(&self, partition: &PartitionKey) -> LinkHandle<L> {
        LinkHandle {
            version: self.version,
            partition: partition.clone(),
            link: Arc::clone(&self.link),
        }
    }

    fn is_current(&self, handle: &LinkHandle<L>) -> bool {
        self.link.name() == handle.name()
    }

    /// Stop the renewal, then close the link and its session.
    async fn close(self, cancel: &CancellationToken, limit: Duration) -> Result<()> {
        self.renewal.cancel();
        let res = close_bounded(cancel, limit, self.link.close(cancel)).await;
        match &self.session {
            Some(session) => res.and(close_bounded(cancel, limit, session.close(cancel)).await),
            None => res,
        }
    }
}

fn take_if_current<L: Link>(
    links: &mut HashMap<PartitionKey, LinkState<L>>,
    handle: &LinkHandle<L>,
) -> Option<LinkState<L>> {
    match links.get(&handle.partition) {
        Some(state) if state.is_current(handle) => links.remove(&handle.partition),
        _ => None,
    }
}

/// Cache of one link per partition key plus a management link.
///
/// Lock order is partition links, then the management link, then the
/// namespace's connection.
pub struct Links<L: Link + 'static> {
    ns: Arc<Namespace>,
    hub: String,
    factory: Arc<dyn LinkFactory<L>>,
    links: RwLock<HashMap<PartitionKey, LinkState<L>>>,
    management: Mutex<Option<LinkState<RpcLink>>>,
    closed: AtomicBool,
}

impl Links<SenderPtr> {
    /// Registry of senders for the partitions of `hub`.
    pub fn senders(ns: Arc<Namespace>, hub: impl Into<String>) -> Self {
        let hub = hub.into();
        let factory = SenderFactory::new(hub.clone());
        Self::new(ns, hub, factory)
    }
}

impl Links<ReceiverPtr> {
    /// Registry of receivers for the partitions of `hub` in `consumer_group`.
    pub fn receivers(ns: Arc<Namespace>, hub: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let hub = hub.into();
        let factory = ReceiverFactory::new(hub.clone(), consumer_group);
        Self::new(ns, hub, factory)
    }
}

impl<L: Link + 'static> Links<L> {
    /// Create an empty registry for `hub`.
    pub fn new(ns: Arc<Namespace>, hub: impl Into<String>, factory: impl LinkFactory<L> + 'static) -> Self {
        Self {
            ns,
            hub: hub.into(),
            factory: Arc::new(factory),
            links: RwLock::new(HashMap::new()),
            management: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The namespace the links are created on.
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    /// Check if [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Keys with a cached link, sorted.
    pub async fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.links.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn policy(&self) -> &RecoveryPolicy {
        &self.ns.options().recovery_policy
    }

    fn close_timeout(&self) -> Duration {
        self.ns.options().close_timeout
    }

    fn management_path(&self) -> String {
        format!("{}/{}", self.hub, self.ns.options().management_address)
    }

    /// Get the link for `partition`, creating it on first use.
    pub async fn get_link(&self, cancel: &CancellationToken, partition: &PartitionKey) -> Result<LinkHandle<L>> {
        if self.is_closed() {
            return Err(HubError::ClientClosed);
        }
        {
            let links = self.links.read().await;
            if let Some(state) = links.get(partition) {
                return Ok(state.handle(partition));
            }
        }

        let mut links = self.links.write().await;
        if self.is_closed() {
            return Err(HubError::ClientClosed);
        }
        if let Some(state) = links.get(partition) {
            return Ok(state.handle(partition));
        }

        tracing::debug!(%partition, "no cached link, creating");
        let (conn, version) = self.ns.get_connection(cancel).await?;
        match self.create_link(cancel, &conn, version, partition).await {
            Ok(state) => {
                let handle = state.handle(partition);
                links.insert(partition.clone(), state);
                Ok(handle)
            }
            Err(err) => {
                if self.policy().classify(&err) == RecoveryKind::Connection {
                    tracing::warn!(%partition, %version, error = %err, "link creation left connection unusable");
                    if let Err(recover_err) = self.recover_connection_locked(cancel, version, &mut links).await {
                        tracing::warn!(%partition, error = %recover_err, "connection recovery failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn create_link(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionPtr,
        version: ConnectionVersion,
        partition: &PartitionKey,
    ) -> Result<LinkState<L>> {
        let entity_path = self.factory.entity_path(partition);
        let renewal = self.ns.negotiate_claim(cancel, &entity_path).await?;
        let session = conn.open_session(cancel).await?;

        let link = match self.factory.create_link(cancel, &session, partition).await {
            Ok(link) => link,
            Err(err) => {
                if let Err(close_err) = close_bounded(cancel, self.close_timeout(), session.close(cancel)).await {
                    tracing::warn!(%partition, error = %close_err, "failed closing session of unattached link");
                }
                return Err(err);
            }
        };

        tracing::info!(%partition, link = link.name(), %version, "link created");
        Ok(LinkState {
            version,
            link: Arc::new(link),
            session: Some(session),
            renewal,
        })
    }

    /// Tear down whatever `err` says is broken.
    ///
    /// Nothing happens without a handle or for transient errors; fatal
    /// errors come straight back. A link-scoped error evicts and closes the
    /// handle's link, unless the cache already holds a different link for
    /// that key. A connection-scoped error recovers the connection at the
    /// handle's version and evicts everything if that closed it.
    ///
    /// Close failures are logged and swallowed, except a close that was
    /// cancelled or timed out: that is returned as [`HubError::Cancelled`]
    /// or [`HubError::ConnResetNeeded`].
    pub async fn recover_if_needed(
        &self,
        cancel: &CancellationToken,
        handle: Option<&LinkHandle<L>>,
        err: &HubError,
    ) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };

        match self.policy().classify(err) {
            RecoveryKind::None => Ok(()),
            RecoveryKind::Fatal => Err(err.clone()),
            RecoveryKind::Link => {
                let evicted = take_if_current(&mut *self.links.write().await, handle);
                match evicted {
                    Some(state) => {
                        tracing::debug!(partition = %handle.partition, link = handle.name(), error = %err, "recovering link");
                        self.close_evicted(cancel, state, &handle.partition).await
                    }
                    None => {
                        tracing::debug!(partition = %handle.partition, link = handle.name(), "link already recovered");
                        Ok(())
                    }
                }
            }
            RecoveryKind::Connection => {
                let mut links = self.links.write().await;
                if self.recover_connection_locked(cancel, handle.version, &mut links).await? {
                    return Ok(());
                }
                // recovered by someone else; our entry may still be on the old connection
                let evicted = take_if_current(&mut links, handle);
                drop(links);
                match evicted {
                    Some(state) => self.close_evicted(cancel, state, &handle.partition).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Recover the connection at `version`. If that closed it, every
    /// cached link is evicted and closed best-effort, even when no new
    /// connection could be created.
    async fn recover_connection_locked(
        &self,
        cancel: &CancellationToken,
        version: ConnectionVersion,
        links: &mut HashMap<PartitionKey, LinkState<L>>,
    ) -> Result<bool> {
        let recovered = match self.ns.recover(cancel, version).await {
            Ok(false) => return Ok(false),
            Ok(true) => Ok(true),
            // the connection at `version` is gone either way
            Err(err) => {
                tracing::warn!(%version, error = %err, "connection closed but not recreated");
                Err(err)
            }
        };

        let evicted: Vec<_> = links.drain().collect();
        let management = self.management.lock().await.take();
        tracing::info!(%version, evicted = evicted.len(), "evicting links after connection recovery");

        for (partition, state) in evicted {
            if let Err(err) = state.close(cancel, self.close_timeout()).await {
                tracing::warn!(%partition, error = %err, "failed closing link after connection recovery");
            }
        }
        if let Some(state) = management {
            if let Err(err) = state.close(cancel, self.close_timeout()).await {
                tracing::warn!(error = %err, "failed closing management link after connection recovery");
            }
        }
        recovered
    }

    async fn close_evicted<T: Link>(
        &self,
        cancel: &CancellationToken,
        state: LinkState<T>,
        partition: &PartitionKey,
    ) -> Result<()> {
        let name = state.link.name().to_owned();
        match state.close(cancel, self.close_timeout()).await {
            Ok(()) => Ok(()),
            Err(err @ (HubError::Cancelled | HubError::ConnResetNeeded)) => {
                tracing::warn!(%partition, link = %name, error = %err, "closing evicted link did not complete");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(%partition, link = %name, error = %err, "failed closing evicted link");
                Ok(())
            }
        }
    }

    /// Run `op` against the link for `partition`, recovering and retrying
    /// on failure as [`retry`](crate::retry::retry) decides.
    pub async fn retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        partition: &PartitionKey,
        name: &str,
        options: &RetryOptions,
        op: F,
    ) -> Result<T>
    where
        F: Fn(LinkHandle<L>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let last: Mutex<Option<LinkHandle<L>>> = Mutex::new(None);
        let (last, op) = (&last, &op);

        crate::retry::retry(cancel, name, options, self.policy(), move |attempt| async move {
            if let Some(err) = &attempt.last_err {
                let prev = last.lock().await.clone();
                self.recover_if_needed(cancel, prev.as_ref(), err).await?;
            }
            let handle = self.get_link(cancel, partition).await?;
            *last.lock().await = Some(handle.clone());
            op(handle).await
        })
        .await
    }

    /// Get the management link, creating it on first use.
    pub async fn get_management_link(&self, cancel: &CancellationToken) -> Result<LinkHandle<RpcLink>> {
        let key = PartitionKey::new(MANAGEMENT_ADDRESS);
        let mut management = self.management.lock().await;
        if self.is_closed() {
            return Err(HubError::ClientClosed);
        }
        if let Some(state) = management.as_ref() {
            return Ok(state.handle(&key));
        }

        let (conn, version) = self.ns.get_connection(cancel).await?;
        match self.create_management_link(cancel, &conn, version).await {
            Ok(state) => {
                let handle = state.handle(&key);
                *management = Some(state);
                Ok(handle)
            }
            Err(err) => {
                drop(management);
                if self.policy().classify(&err) == RecoveryKind::Connection {
                    tracing::warn!(%version, error = %err, "management link creation left connection unusable");
                    let mut links = self.links.write().await;
                    if let Err(recover_err) = self.recover_connection_locked(cancel, version, &mut links).await {
                        tracing::warn!(error = %recover_err, "connection recovery failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn create_management_link(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionPtr,
        version: ConnectionVersion,
    ) -> Result<LinkState<RpcLink>> {
        let path = self.management_path();
        let renewal = self.ns.negotiate_claim(cancel, &path).await?;
        let session = conn.open_session(cancel).await?;

        let link = match RpcLink::open(cancel, session.clone(), &path, self.close_timeout()).await {
            Ok(link) => link,
            Err(err) => {
                if let Err(close_err) = close_bounded(cancel, self.close_timeout(), session.close(cancel)).await {
                    tracing::warn!(error = %close_err, "failed closing session of unattached management link");
                }
                return Err(err);
            }
        };

        tracing::info!(link = link.name(), %version, "management link created");
        // the rpc link ends its own session
        Ok(LinkState {
            version,
            link: Arc::new(link),
            session: None,
            renewal,
        })
    }

    /// Management counterpart of [`recover_if_needed`](Self::recover_if_needed).
    pub async fn recover_management_if_needed(
        &self,
        cancel: &CancellationToken,
        handle: Option<&LinkHandle<RpcLink>>,
        err: &HubError,
    ) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };

        let take_current = |slot: &mut Option<LinkState<RpcLink>>| match slot.as_ref() {
            Some(state) if state.is_current(handle) => slot.take(),
            _ => None,
        };

        let evicted = match self.policy().classify(err) {
            RecoveryKind::None => return Ok(()),
            RecoveryKind::Fatal => return Err(err.clone()),
            RecoveryKind::Link => take_current(&mut *self.management.lock().await),
            RecoveryKind::Connection => {
                let mut links = self.links.write().await;
                if self.recover_connection_locked(cancel, handle.version, &mut links).await? {
                    return Ok(());
                }
                drop(links);
                take_current(&mut *self.management.lock().await)
            }
        };

        match evicted {
            Some(state) => {
                tracing::debug!(link = handle.name(), error = %err, "recovering management link");
                self.close_evicted(cancel, state, &handle.partition).await
            }
            None => Ok(()),
        }
    }

    /// Send a management request, recovering and retrying on failure.
    pub async fn management_rpc(
        &self,
        cancel: &CancellationToken,
        request: Message,
        options: &RetryOptions,
    ) -> Result<RpcResponse> {
        let last: Mutex<Option<LinkHandle<RpcLink>>> = Mutex::new(None);
        let (last, request) = (&last, &request);

        crate::retry::retry(cancel, "management", options, self.policy(), move |attempt| async move {
            if let Some(err) = &attempt.last_err {
                let prev = last.lock().await.clone();
                self.recover_management_if_needed(cancel, prev.as_ref(), err).await?;
            }
            let handle = self.get_management_link(cancel).await?;
            *last.lock().await = Some(handle.clone());
            handle.link().rpc(cancel, request.clone()).await
        })
        .await
    }

    /// Close every cached link and refuse further use.
    ///
    /// Every link is closed even if some fail. Each failure is logged at
    /// `warn` and the first one is returned. The namespace is left open;
    /// it may be shared with other registries.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let mut links = self.links.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let evicted: Vec<_> = links.drain().collect();
        drop(links);
        let management = self.management.lock().await.take();

        let mut result = Ok(());
        for (partition, state) in evicted {
            if let Err(err) = state.close(cancel, self.close_timeout()).await {
                tracing::warn!(%partition, error = %err, "failed closing link");
                result = result.and(Err(err));
            }
        }
        if let Some(state) = management {
            if let Err(err) = state.close(cancel, self.close_timeout()).await {
                tracing::warn!(error = %err, "failed closing management link");
                result = result.and(Err(err));
            }
        }
        tracing::debug!(hub = %self.hub, "link registry closed");
        result
    }
}
