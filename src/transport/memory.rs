//! In-process broker implementing the transport traits.
//!
//! [`MemoryBroker`] keeps one queue per address and answers claim
//! (`$cbs`) and management requests itself. Faults are injected from the
//! test side:
//!
//! - [`MemoryBroker::detach_link`]: the peer detaches one link
//! - [`MemoryBroker::drop_connection`]: the current connection dies
//! - [`MemoryBroker::fail_next_connect`]: the next `open_connection` fails
//! - [`MemoryBroker::set_cbs_status`]: claims are rejected with a status
//! - [`MemoryBroker::set_close_delay`]: link closes hang for a while
//!
//! # Quick start
//!
//! ```rust
//! use hublink::transport::memory::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! broker.set_cbs_status(401, "InvalidSignature");
//! assert_eq!(broker.stats().connections_opened, 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::message::{Message, PropertyValue};
use crate::types::{Condition, CBS_ADDRESS, MANAGEMENT_ADDRESS};

use super::{
    AmqpConnection, AmqpSession, Connector, ConnectionPtr, Link, LinkOptions, ReceiverLink,
    ReceiverPtr, SenderLink, SenderPtr, SessionPtr,
};

/// Counters describing what the broker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed by the client.
    pub connections_closed: u64,
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Sessions closed by the client.
    pub sessions_closed: u64,
    /// Links attached.
    pub links_opened: u64,
    /// Links closed by the client.
    pub links_closed: u64,
}

/// Per-link bookkeeping.
struct LinkRecord {
    connection: u64,
    session: u64,
    /// Set once the link is detached or closed.
    error: Option<HubError>,
}

/// Mutable broker state.
struct BrokerState {
    /// Failures to return from upcoming `open_connection` calls.
    connect_failures: VecDeque<HubError>,
    /// Connection id to close reason (`None` while open).
    connections: HashMap<u64, Option<HubError>>,
    /// Session id to closed flag.
    sessions: HashMap<u64, bool>,
    links: HashMap<String, LinkRecord>,
    queues: HashMap<String, VecDeque<Message>>,
    cbs_status: (u16, String),
    management_status: (u16, String),
    management_body: Bytes,
    /// Audiences with accepted claims, in order.
    claims: Vec<String>,
    close_delay: Duration,
    stats: BrokerStats,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connect_failures: VecDeque::new(),
            connections: HashMap::new(),
            sessions: HashMap::new(),
            links: HashMap::new(),
            queues: HashMap::new(),
            cbs_status: (202, "Accepted".into()),
            management_status: (200, "OK".into()),
            management_body: Bytes::new(),
            claims: Vec::new(),
            close_delay: Duration::ZERO,
            stats: BrokerStats::default(),
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_id: AtomicU64,
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker that accepts every claim.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // a panic while holding the lock only happens in a failing test
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // --- fault injection

    /// Make the next `open_connection` call fail with `err`.
    pub fn fail_next_connect(&self, err: HubError) {
        self.state().connect_failures.push_back(err);
    }

    /// Detach a link from the broker side.
    pub fn detach_link(&self, name: &str, condition: Option<Condition>) {
        let mut state = self.state();
        if let Some(record) = state.links.get_mut(name) {
            record.error = Some(HubError::detached(name, condition, "detached by broker"));
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Kill every open connection from the broker side.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        for reason in state.connections.values_mut() {
            if reason.is_none() {
                *reason = Some(HubError::ConnectionClosed("connection reset by broker".into()));
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Answer claim requests with this status.
    pub fn set_cbs_status(&self, code: u16, description: &str) {
        self.state().cbs_status = (code, description.to_owned());
    }

    /// Answer management requests with this status and body.
    pub fn set_management_response(&self, code: u16, description: &str, body: impl Into<Bytes>) {
        let mut state = self.state();
        state.management_status = (code, description.to_owned());
        state.management_body = body.into();
    }

    /// Make every link close take this long.
    pub fn set_close_delay(&self, delay: Duration) {
        self.state().close_delay = delay;
    }

    // --- inspection

    /// Snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        self.state().stats.clone()
    }

    /// Audiences with accepted claims, oldest first.
    pub fn claims(&self) -> Vec<String> {
        self.state().claims.clone()
    }

    /// Number of accepted claims for `audience`.
    pub fn claim_count(&self, audience: &str) -> usize {
        self.state().claims.iter().filter(|a| *a == audience).count()
    }

    /// Names of links that are still attached.
    pub fn open_links(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .links
            .iter()
            .filter(|(_, record)| record.error.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Messages waiting at `address`.
    pub fn queued(&self, address: &str) -> usize {
        self.state().queues.get(address).map_or(0, VecDeque::len)
    }

    /// Enqueue a message for receivers of `address`.
    pub fn push(&self, address: &str, message: Message) {
        self.state()
            .queues
            .entry(address.to_owned())
            .or_default()
            .push_back(message);
        self.inner.notify.notify_waiters();
    }

    // --- link plumbing

    fn check_connection(state: &BrokerState, connection: u64) -> Result<()> {
        match state.connections.get(&connection) {
            Some(None) => Ok(()),
            Some(Some(err)) => Err(err.clone()),
            None => Err(HubError::ConnectionClosed("unknown connection".into())),
        }
    }

    fn check_session(state: &BrokerState, connection: u64, session: u64) -> Result<()> {
        Self::check_connection(state, connection)?;
        match state.sessions.get(&session) {
            Some(false) => Ok(()),
            _ => Err(HubError::SessionClosed(format!("session {session} ended"))),
        }
    }

    fn check_link(state: &BrokerState, name: &str) -> Result<()> {
        let record = state
            .links
            .get(name)
            .ok_or_else(|| HubError::LinkClosed(name.to_owned()))?;
        Self::check_session(state, record.connection, record.session)?;
        match &record.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn attach(&self, connection: u64, session: u64, kind: &str, options: &LinkOptions) -> Result<String> {
        let mut state = self.state();
        Self::check_session(&state, connection, session)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{kind}-{}", self.next_id()));
        state.links.insert(
            name.clone(),
            LinkRecord {
                connection,
                session,
                error: None,
            },
        );
        state.stats.links_opened += 1;
        Ok(name)
    }

    async fn close_link(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let delay = self.state().close_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(HubError::Cancelled),
            }
        }

        let mut state = self.state();
        let closed_already = match state.links.get_mut(name) {
            Some(record) if record.error.is_none() => {
                record.error = Some(HubError::LinkClosed(name.to_owned()));
                false
            }
            _ => true,
        };
        state.stats.links_closed += 1;
        drop(state);
        self.inner.notify.notify_waiters();

        if closed_already {
            tracing::debug!(link = name, "close on a link that was already detached");
        }
        Ok(())
    }

    /// Route a sent message: claims and management requests are answered,
    /// anything else is queued at its address.
    fn deliver(&self, address: &str, message: Message) {
        let mut state = self.state();
        if address == CBS_ADDRESS {
            let (code, description) = state.cbs_status.clone();
            if (200..300).contains(&code) {
                if let Some(audience) = message.property("name").and_then(PropertyValue::as_str) {
                    state.claims.push(audience.to_owned());
                }
            }
            Self::reply(&mut state, &message, code, &description, Bytes::new());
        } else if address.ends_with(MANAGEMENT_ADDRESS) {
            let (code, description) = state.management_status.clone();
            let body = state.management_body.clone();
            Self::reply(&mut state, &message, code, &description, body);
        } else {
            state
                .queues
                .entry(address.to_owned())
                .or_default()
                .push_back(message);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    fn reply(state: &mut BrokerState, request: &Message, code: u16, description: &str, body: Bytes) {
        let Some(reply_to) = request.reply_to.clone() else {
            return;
        };
        let reply = request
            .create_reply()
            .property("status-code", i64::from(code))
            .property("status-description", description)
            .body(body)
            .build();
        state.queues.entry(reply_to).or_default().push_back(reply);
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open_connection(&self) -> Result<ConnectionPtr> {
        let mut state = self.state();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        let id = self.next_id();
        state.connections.insert(id, None);
        state.stats.connections_opened += 1;
        drop(state);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn open_session(&self, cancel: &CancellationToken) -> Result<SessionPtr> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        let mut state = self.broker.state();
        MemoryBroker::check_connection(&state, self.id)?;
        let id = self.broker.next_id();
        state.sessions.insert(id, false);
        state.stats.sessions_opened += 1;
        drop(state);

        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            connection: self.id,
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        if let Some(reason) = state.connections.get_mut(&self.id) {
            if reason.is_none() {
                *reason = Some(HubError::ConnectionClosed("closed by client".into()));
            }
        }
        state.stats.connections_closed += 1;
        drop(state);
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

/// Session on a [`MemoryConnection`].
pub struct MemorySession {
    broker: MemoryBroker,
    connection: u64,
    id: u64,
}

#[async_trait]
impl AmqpSession for MemorySession {
    async fn open_sender(
        &self,
        cancel: &CancellationToken,
        address: &str,
        options: LinkOptions,
    ) -> Result<SenderPtr> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        let name = self.broker.attach(self.connection, self.id, "sender", &options)?;
        Ok(Box::new(MemorySender {
            broker: self.broker.clone(),
            name,
            address: address.to_owned(),
        }))
    }

    async fn open_receiver(
        &self,
        cancel: &CancellationToken,
        source: &str,
        options: LinkOptions,
    ) -> Result<ReceiverPtr> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        let name = self.broker.attach(self.connection, self.id, "receiver", &options)?;
        let queue = options.target_address.unwrap_or_else(|| source.to_owned());
        Ok(Box::new(MemoryReceiver {
            broker: self.broker.clone(),
            name,
            queue,
            credits: AtomicU32::new(options.initial_credit),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        let mut state = self.broker.state();
        state.sessions.insert(self.id, true);
        state.stats.sessions_closed += 1;
        drop(state);
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

/// Sender link on a [`MemorySession`].
pub struct MemorySender {
    broker: MemoryBroker,
    name: String,
    address: String,
}

#[async_trait]
impl Link for MemorySender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.broker.close_link(cancel, &self.name).await
    }
}

#[async_trait]
impl SenderLink for MemorySender {
    async fn send(&self, cancel: &CancellationToken, message: Message) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        MemoryBroker::check_link(&self.broker.state(), &self.name)?;
        self.broker.deliver(&self.address, message);
        Ok(())
    }
}

/// Receiver link on a [`MemorySession`].
pub struct MemoryReceiver {
    broker: MemoryBroker,
    name: String,
    queue: String,
    credits: AtomicU32,
    closed: AtomicBool,
}

#[async_trait]
impl Link for MemoryReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.broker.close_link(cancel, &self.name).await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Message> {
        loop {
            // registered before the state check so a delivery in between
            // still wakes us
            let notified = self.broker.inner.notify.notified();
            {
                let mut state = self.broker.state();
                MemoryBroker::check_link(&state, &self.name)?;
                if self.credits.load(Ordering::Acquire) > 0 {
                    if let Some(message) = state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front) {
                        self.credits.fetch_sub(1, Ordering::AcqRel);
                        return Ok(message);
                    }
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(HubError::Cancelled),
            }
        }
    }

    fn issue_credit(&self, credit: u32) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::LinkClosed(self.name.clone()));
        }
        self.credits.fetch_add(credit, Ordering::AcqRel);
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    fn credits(&self) -> u32 {
        self.credits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_pair(broker: &MemoryBroker) -> (SenderPtr, ReceiverPtr) {
        let cancel = CancellationToken::new();
        let conn = broker.open_connection().await.unwrap();
        let session = conn.open_session(&cancel).await.unwrap();
        let sender = session
            .open_sender(&cancel, "hub/Partitions/0", LinkOptions::default())
            .await
            .unwrap();
        let receiver = session
            .open_receiver(&cancel, "hub/Partitions/0", LinkOptions::default())
            .await
            .unwrap();
        (sender, receiver)
    }

    #[tokio::test]
    async fn test_send_and_receive_consumes_credit() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (sender, receiver) = open_pair(&broker).await;

        sender.send(&cancel, Message::new(b"one".as_slice())).await.unwrap();
        assert_eq!(broker.queued("hub/Partitions/0"), 1);

        receiver.issue_credit(1).unwrap();
        assert_eq!(receiver.credits(), 1);

        let msg = receiver.receive(&cancel).await.unwrap();
        assert_eq!(msg.body.as_ref(), b"one");
        assert_eq!(receiver.credits(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_receive_keeps_credit() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (_sender, receiver) = open_pair(&broker).await;

        receiver.issue_credit(2).unwrap();
        cancel.cancel();
        let err = receiver.receive(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(receiver.credits(), 2);
    }

    #[tokio::test]
    async fn test_detach_surfaces_on_next_send() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (sender, _receiver) = open_pair(&broker).await;

        broker.detach_link(sender.name(), Some(Condition::DETACH_FORCED));
        let err = sender.send(&cancel, Message::default()).await.unwrap_err();
        assert!(matches!(err, HubError::Detached { .. }));
        assert_eq!(err.condition(), Some(&Condition::DETACH_FORCED));
    }

    #[tokio::test]
    async fn test_drop_connection_fails_links() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (sender, receiver) = open_pair(&broker).await;

        broker.drop_connection();
        let err = sender.send(&cancel, Message::default()).await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed(_)));

        receiver.issue_credit(1).unwrap();
        let err = receiver.receive(&cancel).await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_fail_next_connect() {
        let broker = MemoryBroker::new();
        broker.fail_next_connect(HubError::Timeout);

        assert!(matches!(broker.open_connection().await, Err(HubError::Timeout)));
        assert!(broker.open_connection().await.is_ok());
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_closed_link_reports_closed() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (sender, _receiver) = open_pair(&broker).await;

        sender.close(&cancel).await.unwrap();
        let err = sender.send(&cancel, Message::default()).await.unwrap_err();
        assert!(matches!(err, HubError::LinkClosed(_)));
        assert_eq!(broker.stats().links_closed, 1);
        assert_eq!(broker.open_links().len(), 1);
    }
}
