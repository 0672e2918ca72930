//! The namespace: one shared, versioned connection plus claim renewal.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cbs;
use crate::credential::TokenCredential;
use crate::error::{HubError, Result};
use crate::recovery::RecoveryKind;
use crate::transport::{close_bounded, ConnectionPtr, Connector};
use crate::types::ConnectionVersion;

use super::config::ClientOptions;
use super::state::NamespaceStats;

struct ConnectionSlot {
    conn: Option<ConnectionPtr>,
    version: ConnectionVersion,
    closed: bool,
}

/// Owner of the single physical connection.
///
/// Every connection gets the next [`ConnectionVersion`]; callers pass the
/// version they saw back to [`Namespace::recover`] so that concurrent
/// recoveries of the same failure replace the connection only once.
pub struct Namespace {
    connector: Arc<dyn Connector>,
    credential: Arc<dyn TokenCredential>,
    options: ClientOptions,
    slot: RwLock<ConnectionSlot>,
    /// Parent of every renewal loop's token. Replaced on a non-permanent close.
    shutdown: Mutex<CancellationToken>,
    stats: Mutex<NamespaceStats>,
}

impl Namespace {
    /// Create a namespace. No connection is opened until first use.
    pub fn new(
        connector: impl Connector + 'static,
        credential: impl TokenCredential + 'static,
        options: ClientOptions,
    ) -> Self {
        Self::from_parts(Arc::new(connector), Arc::new(credential), options)
    }

    /// Create a namespace from shared collaborators.
    pub fn from_parts(
        connector: Arc<dyn Connector>,
        credential: Arc<dyn TokenCredential>,
        options: ClientOptions,
    ) -> Self {
        Self {
            connector,
            credential,
            options,
            slot: RwLock::new(ConnectionSlot {
                conn: None,
                version: ConnectionVersion::default(),
                closed: false,
            }),
            shutdown: Mutex::new(CancellationToken::new()),
            stats: Mutex::new(NamespaceStats::default()),
        }
    }

    /// Client options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> NamespaceStats {
        self.stats_mut().clone()
    }

    /// Version of the current (or last) connection.
    pub async fn version(&self) -> ConnectionVersion {
        self.slot.read().await.version
    }

    /// Check if the namespace was closed permanently.
    pub async fn is_closed(&self) -> bool {
        self.slot.read().await.closed
    }

    fn stats_mut(&self) -> MutexGuard<'_, NamespaceStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Get the current connection and its version, creating it if needed.
    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(ConnectionPtr, ConnectionVersion)> {
        {
            let slot = self.slot.read().await;
            if slot.closed {
                return Err(HubError::ClientClosed);
            }
            if let Some(conn) = &slot.conn {
                return Ok((conn.clone(), slot.version));
            }
        }

        let mut slot = self.slot.write().await;
        if slot.closed {
            return Err(HubError::ClientClosed);
        }
        // somebody else may have created it while we waited
        if let Some(conn) = &slot.conn {
            return Ok((conn.clone(), slot.version));
        }
        let conn = self.create_connection(cancel, &mut slot).await?;
        Ok((conn, slot.version))
    }

    async fn create_connection(
        &self,
        cancel: &CancellationToken,
        slot: &mut ConnectionSlot,
    ) -> Result<ConnectionPtr> {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            res = self.connector.open_connection() => res,
        };

        match res {
            Ok(conn) => {
                slot.version = slot.version.next();
                slot.conn = Some(conn.clone());
                self.stats_mut().record_connect(slot.version);
                tracing::info!(version = %slot.version, "connection created");
                Ok(conn)
            }
            Err(err) => {
                self.stats_mut().record_connect_failure();
                tracing::warn!(error = %err, "failed to create connection");
                Err(err)
            }
        }
    }

    /// Replace the connection if it is still at `suspect`.
    ///
    /// Returns `Ok(false)` without doing anything when the version has
    /// already moved on. Otherwise the old connection is closed
    /// (best-effort) and a new one created; a creation failure is returned
    /// and leaves no cached connection, so the next
    /// [`get_connection`](Self::get_connection) tries again.
    pub async fn recover(&self, cancel: &CancellationToken, suspect: ConnectionVersion) -> Result<bool> {
        let mut slot = self.slot.write().await;
        if slot.closed {
            return Err(HubError::ClientClosed);
        }
        if slot.version != suspect {
            self.stats_mut().record_recovery_skipped();
            tracing::debug!(
                version = %slot.version,
                %suspect,
                "connection already recovered, skipping"
            );
            return Ok(false);
        }

        tracing::info!(version = %suspect, "recovering connection");
        if let Some(old) = slot.conn.take() {
            if let Err(err) = close_bounded(cancel, self.options.close_timeout, old.close()).await {
                tracing::warn!(version = %suspect, error = %err, "failed closing old connection");
            }
        }

        self.create_connection(cancel, &mut slot).await?;
        self.stats_mut().record_recovery();
        Ok(true)
    }

    /// Authenticate `entity_path` and keep the claim renewed.
    ///
    /// The first negotiation happens before returning. If the token
    /// expires, a background task renews the claim ahead of expiry until
    /// the returned [`ClaimRenewal`] is cancelled or dropped, or the
    /// namespace is closed.
    pub async fn negotiate_claim(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        entity_path: &str,
    ) -> Result<ClaimRenewal> {
        let audience = self.options.audience(entity_path);
        let Some(expires_on) = self.negotiate_once(cancel, &audience).await? else {
            tracing::debug!(%audience, "token does not expire, claim won't be renewed");
            return Ok(ClaimRenewal::inactive());
        };

        let token = self.shutdown_token().child_token();
        let task = tokio::spawn(renew_claim(
            Arc::downgrade(self),
            token.clone(),
            audience,
            expires_on,
        ));
        Ok(ClaimRenewal {
            token,
            task: Some(task),
        })
    }

    async fn negotiate_once(&self, cancel: &CancellationToken, audience: &str) -> Result<Option<SystemTime>> {
        let (conn, version) = self.get_connection(cancel).await?;
        self.negotiate_on(cancel, &conn, version, audience).await
    }

    /// One renewal tick. A claim that leaves the connection unusable
    /// recovers it, so the next tick starts on a fresh one.
    async fn renew_once(&self, cancel: &CancellationToken, audience: &str) -> Result<Option<SystemTime>> {
        let (conn, version) = self.get_connection(cancel).await?;
        let res = self.negotiate_on(cancel, &conn, version, audience).await;
        if let Err(err) = &res {
            if self.options.recovery_policy.classify(err) == RecoveryKind::Connection {
                if let Err(recover_err) = self.recover(cancel, version).await {
                    tracing::warn!(%audience, error = %recover_err, "recovery after failed claim renewal failed");
                }
            }
        }
        res
    }

    async fn negotiate_on(
        &self,
        cancel: &CancellationToken,
        conn: &ConnectionPtr,
        version: ConnectionVersion,
        audience: &str,
    ) -> Result<Option<SystemTime>> {
        let res = cbs::negotiate_claim(
            cancel,
            conn.as_ref(),
            self.credential.as_ref(),
            &self.options.cbs_address,
            audience,
            self.options.close_timeout,
        )
        .await;
        self.stats_mut().record_claim(res.is_ok());

        match &res {
            Ok(_) => tracing::info!(%audience, %version, "claim negotiated"),
            Err(err) => tracing::debug!(%audience, %version, error = %err, "claim negotiation failed"),
        }
        res
    }

    /// Close the connection and stop every renewal loop.
    ///
    /// With `permanent`, every later call fails with
    /// [`HubError::ClientClosed`]. Otherwise the next
    /// [`get_connection`](Self::get_connection) opens a new connection.
    pub async fn close(&self, cancel: &CancellationToken, permanent: bool) -> Result<()> {
        {
            let mut shutdown = self
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shutdown.cancel();
            *shutdown = CancellationToken::new();
        }

        let mut slot = self.slot.write().await;
        if permanent {
            slot.closed = true;
        }
        let Some(conn) = slot.conn.take() else {
            return Ok(());
        };
        tracing::info!(version = %slot.version, permanent, "closing connection");
        close_bounded(cancel, self.options.close_timeout, conn.close()).await
    }
}

async fn renew_claim(
    ns: Weak<Namespace>,
    token: CancellationToken,
    audience: String,
    mut expires_on: SystemTime,
) {
    loop {
        let Some(bounds) = ns.upgrade().map(|ns| ns.options.claim_refresh.clone()) else {
            return;
        };
        let wait = bounds.next_refresh(expires_on, SystemTime::now());
        tracing::debug!(%audience, ?wait, "next claim refresh scheduled");

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(ns) = ns.upgrade() else {
            return;
        };
        match ns.renew_once(&token, &audience).await {
            Ok(Some(next)) => expires_on = next,
            Ok(None) => {
                tracing::debug!(%audience, "token no longer expires, stopping claim renewal");
                return;
            }
            Err(_) if token.is_cancelled() => return,
            Err(err) => {
                if ns.options.recovery_policy.classify(&err) == RecoveryKind::Fatal {
                    tracing::error!(%audience, error = %err, "claim renewal stopped");
                    return;
                }
                tracing::warn!(%audience, error = %err, "claim renewal failed, retrying on next refresh");
            }
        }
    }
}

/// Handle to a claim's background renewal.
///
/// Dropping it stops the renewal.
#[derive(Debug)]
pub struct ClaimRenewal {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ClaimRenewal {
    fn inactive() -> Self {
        Self {
            token: CancellationToken::new(),
            task: None,
        }
    }

    /// Stop renewing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if a renewal loop is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ClaimRenewal {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
