//! Retry loop with recovery-aware backoff.
//!
//! [`retry`] runs an operation until it succeeds, the error is fatal, the
//! budget in [`RetryOptions`] runs out, or the caller cancels. The
//! operation is told through [`Attempt::last_err`] what went wrong last
//! time so it can recover resources before trying again.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::RetryOptions;
use crate::error::{HubError, Result};
use crate::recovery::{RecoveryKind, RecoveryPolicy};

/// What the operation is told about the attempt it is running.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 0 for the first attempt. A quick retry runs at index 0 again.
    pub index: u32,
    /// Error from the previous attempt, `None` the first time.
    pub last_err: Option<HubError>,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and return the error.
    Stop,
    /// Retry right away.
    Immediate,
    /// Retry after a delay.
    After(Duration),
}

/// Per-call retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt: u32,
    quick_retry_used: bool,
}

impl RetryState {
    /// Fresh state for a new call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the attempt about to run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if the one immediate retry has been spent.
    pub fn quick_retry_used(&self) -> bool {
        self.quick_retry_used
    }

    /// Record a failure and decide what happens next.
    pub fn on_failure(
        &mut self,
        err: &HubError,
        options: &RetryOptions,
        policy: &RecoveryPolicy,
    ) -> RetryDecision {
        let kind = policy.classify(err);
        if kind == RecoveryKind::Fatal {
            return RetryDecision::Stop;
        }

        // the detach may have been delivered late; the link is likely
        // already gone, so a fresh one will probably work right away
        if self.attempt == 0 && !self.quick_retry_used && policy.is_quick_recovery_error(err) {
            self.quick_retry_used = true;
            return RetryDecision::Immediate;
        }

        self.attempt += 1;
        if !options.should_retry(self.attempt) {
            return RetryDecision::Stop;
        }

        match (kind, options.link_recovery_delay) {
            (RecoveryKind::Link, Some(delay)) => RetryDecision::After(delay),
            _ => RetryDecision::After(options.delay_for_attempt(self.attempt)),
        }
    }
}

/// Run `op` until it succeeds or retrying stops.
///
/// The error returned is the one from the last attempt, unchanged, or
/// [`HubError::Cancelled`] if `cancel` fires during a backoff.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    name: &str,
    options: &RetryOptions,
    policy: &RecoveryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new();
    let mut last_err = None;

    loop {
        let attempt = Attempt {
            index: state.attempt(),
            last_err: last_err.take(),
        };

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match state.on_failure(&err, options, policy) {
            RetryDecision::Stop => {
                tracing::debug!(operation = name, attempt = state.attempt(), error = %err, "giving up");
                return Err(err);
            }
            RetryDecision::Immediate => {
                tracing::debug!(operation = name, error = %err, "quick retry after detach");
            }
            RetryDecision::After(delay) => {
                tracing::debug!(
                    operation = name,
                    attempt = state.attempt(),
                    ?delay,
                    error = %err,
                    "retrying after delay"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(HubError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        last_err = Some(err);
    }
}
