//! Claim negotiation over the claims-based security node.
//!
//! A claim authenticates one audience (entity path) on one connection. It
//! is a single `put-token` request on a short-lived [`RpcLink`] that is
//! torn down whatever the outcome.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::credential::TokenCredential;
use crate::error::{HubError, Result};
use crate::message::Message;
use crate::rpc::RpcLink;
use crate::transport::{close_bounded, AmqpConnection, Link};
use crate::types::is_success_status;

/// Operation name for a claim request.
pub const PUT_TOKEN: &str = "put-token";

/// Authenticate `audience` on `conn`.
///
/// Returns the token expiry reported by the credential, `None` when the
/// token does not expire.
///
/// A rejected claim becomes [`HubError::Auth`]. If the request fails and
/// the follow-up cleanup is cancelled or times out, the result is
/// [`HubError::ConnResetNeeded`] instead of the original error, since the
/// `$cbs` link may be left half open on the connection.
pub async fn negotiate_claim(
    cancel: &CancellationToken,
    conn: &dyn AmqpConnection,
    credential: &dyn TokenCredential,
    cbs_address: &str,
    audience: &str,
    close_timeout: Duration,
) -> Result<Option<SystemTime>> {
    let session = conn.open_session(cancel).await?;
    let link = match RpcLink::open(cancel, session.clone(), cbs_address, close_timeout).await {
        Ok(link) => link,
        Err(err) => {
            if let Err(close_err) = close_bounded(cancel, close_timeout, session.close(cancel)).await {
                tracing::warn!(%audience, error = %close_err, "failed closing claim session");
            }
            return Err(err);
        }
    };

    let outcome = put_token(cancel, &link, credential, audience).await;

    // the link is closed whatever the outcome; each part of the close is
    // time-boxed by the link itself
    match link.close(cancel).await {
        Ok(()) => outcome,
        Err(close_err) => {
            tracing::warn!(%audience, error = %close_err, "failed closing claim link");
            match close_err {
                HubError::Cancelled | HubError::ConnResetNeeded | HubError::Timeout => {
                    Err(HubError::ConnResetNeeded)
                }
                _ => outcome,
            }
        }
    }
}

async fn put_token(
    cancel: &CancellationToken,
    link: &RpcLink,
    credential: &dyn TokenCredential,
    audience: &str,
) -> Result<Option<SystemTime>> {
    let token = credential.get_token(audience).await.map_err(|err| match err {
        HubError::Credential(_) => err,
        other => HubError::Credential(other.to_string()),
    })?;

    let mut request = Message::builder()
        .property("operation", PUT_TOKEN)
        .property("type", token.token_type.as_str())
        .property("name", audience)
        .body(token.token.clone().into_bytes());
    if let Some(expires_on) = token.expires_on {
        request = request.property("expiration", unix_millis(expires_on));
    }

    let response = link.exchange(cancel, request.build()).await?;
    if !is_success_status(response.code) {
        return Err(HubError::Auth {
            status_code: response.code,
            description: response.description,
        });
    }

    tracing::debug!(%audience, status = response.code, "claim accepted");
    Ok(token.expires_on)
}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
