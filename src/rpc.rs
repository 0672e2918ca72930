//! Request/response link.
//!
//! An [`RpcLink`] pairs a sender on a node address with a receiver whose
//! target is a private reply address. Requests carry a fresh message id
//! and the response is matched on its correlation id. Requests are
//! serialized; one exchange is in flight at a time.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::message::{Message, PropertyValue};
use crate::transport::{close_bounded, Link, LinkOptions, ReceiverPtr, SenderPtr, SessionPtr};
use crate::types::is_success_status;

/// Application property holding the response status.
pub const STATUS_CODE: &str = "status-code";

/// Application property holding the response status text.
pub const STATUS_DESCRIPTION: &str = "status-description";

/// A decoded response.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    /// Status code.
    pub code: u16,
    /// Status text.
    pub description: String,
    /// The full response message.
    pub message: Message,
}

impl RpcResponse {
    fn from_message(message: Message) -> Result<Self> {
        let code = message
            .property(STATUS_CODE)
            .and_then(PropertyValue::as_int)
            .and_then(|c| u16::try_from(c).ok())
            .ok_or_else(|| HubError::InvalidResponse("missing status-code".into()))?;
        let description = message
            .property(STATUS_DESCRIPTION)
            .and_then(PropertyValue::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(Self {
            code,
            description,
            message,
        })
    }
}

/// Sender/receiver pair used for request/response exchanges.
pub struct RpcLink {
    name: String,
    address: String,
    reply_to: String,
    sender: SenderPtr,
    receiver: Mutex<ReceiverPtr>,
    session: SessionPtr,
    close_timeout: Duration,
}

impl RpcLink {
    /// Attach a request/response pair to `address` on `session`.
    ///
    /// The link owns `session` and ends it on close.
    pub async fn open(
        cancel: &CancellationToken,
        session: SessionPtr,
        address: &str,
        close_timeout: Duration,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let reply_to = format!("{address}-reply-{id}");

        let sender = session
            .open_sender(cancel, address, LinkOptions::default())
            .await?;

        let receiver = match session
            .open_receiver(
                cancel,
                address,
                LinkOptions::default().with_target_address(reply_to.clone()),
            )
            .await
        {
            Ok(receiver) => receiver,
            Err(err) => {
                if let Err(close_err) = close_bounded(cancel, close_timeout, sender.close(cancel)).await {
                    tracing::warn!(%address, error = %close_err, "failed closing rpc sender after receiver attach failed");
                }
                return Err(err);
            }
        };

        let name = sender.name().to_owned();
        tracing::debug!(link = %name, %address, "rpc link attached");

        Ok(Self {
            name,
            address: address.to_owned(),
            reply_to,
            sender,
            receiver: Mutex::new(receiver),
            session,
            close_timeout,
        })
    }

    /// Node address the requests go to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send `request` and wait for its response.
    ///
    /// Non-2xx responses are turned into [`HubError::Rpc`].
    pub async fn rpc(&self, cancel: &CancellationToken, request: Message) -> Result<RpcResponse> {
        let response = self.exchange(cancel, request).await?;
        if !is_success_status(response.code) {
            return Err(HubError::Rpc {
                status_code: response.code,
                description: response.description,
            });
        }
        Ok(response)
    }

    /// Send `request` and return whatever status comes back.
    pub async fn exchange(&self, cancel: &CancellationToken, mut request: Message) -> Result<RpcResponse> {
        let message_id = Uuid::new_v4().to_string();
        request.message_id = Some(message_id.clone());
        request.reply_to = Some(self.reply_to.clone());

        let receiver = self.receiver.lock().await;
        receiver.issue_credit(1)?;
        self.sender.send(cancel, request).await?;

        loop {
            let message = receiver.receive(cancel).await?;
            if message.correlation_id.as_deref() == Some(message_id.as_str()) {
                return RpcResponse::from_message(message);
            }
            tracing::debug!(link = %self.name, "dropping uncorrelated rpc response");
            receiver.issue_credit(1)?;
        }
    }
}

#[async_trait]
impl Link for RpcLink {
    fn name(&self) -> &str {
        &self.name
    }

    /// Close both links and the session.
    ///
    /// Every part is attempted; the first failure is returned. A close
    /// that hangs past the close timeout yields [`HubError::ConnResetNeeded`].
    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let receiver = self.receiver.lock().await;
        let results = [
            close_bounded(cancel, self.close_timeout, self.sender.close(cancel)).await,
            close_bounded(cancel, self.close_timeout, receiver.close(cancel)).await,
            close_bounded(cancel, self.close_timeout, self.session.close(cancel)).await,
        ];
        results.into_iter().collect()
    }
}
