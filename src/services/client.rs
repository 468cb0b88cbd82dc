//! Action client — request a condition change and await the answer.
//!
//! DESIGN
//! ======
//! One listener task per client watches the response channel. Each call
//! registers a oneshot waiter under its fresh `callId` before the request
//! goes out, then waits with a deadline. The listener resolves a waiter
//! only when both `callId` and `requesterId` match, so other callers'
//! traffic on the shared channel is ignored.
//!
//! A drop guard removes the waiter in every outcome: answered, timed out,
//! send failed, or the caller abandoned the future.
//!
//! A timeout says nothing about the remote outcome. The request may have
//! executed and only the response was lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Broadcast, BusError};
use crate::config::MarkerConfig;
use crate::protocol::{Action, ActionError, ActionResponse, CallContext, ErrorCode, RawRequest, new_call_id};
use crate::scene::{Player, StoreError};

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<ActionResponse>>>>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("player identity unavailable: {0}")]
    Player(#[from] StoreError),
    #[error("response listener stopped")]
    ListenerClosed,
    #[error("pending call table poisoned")]
    Poisoned,
}

impl ErrorCode for ClientError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Action(e) => e.error_code(),
            Self::Bus(e) => e.error_code(),
            Self::Player(e) => e.error_code(),
            Self::ListenerClosed => "E_LISTENER_CLOSED",
            Self::Poisoned => "E_POISONED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Action(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Removes a call's waiter when dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    call_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut calls = match self.pending.lock() {
            Ok(calls) => calls,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls.remove(self.call_id);
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct ActionClient {
    bus: Arc<dyn Broadcast>,
    requester_id: String,
    config: MarkerConfig,
    pending: PendingCalls,
    task: Option<JoinHandle<()>>,
}

impl ActionClient {
    /// Resolve the caller's identity and start listening for responses.
    ///
    /// # Errors
    ///
    /// Returns an error if the player id is unavailable or the response
    /// channel cannot be subscribed.
    pub async fn start(bus: Arc<dyn Broadcast>, player: &dyn Player, config: MarkerConfig) -> Result<Self, ClientError> {
        let requester_id = player.id().await?;
        let mut responses = bus.subscribe(&config.response_channel)?;
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        let listener_pending = Arc::clone(&pending);
        let listener_id = requester_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match responses.recv().await {
                    Ok(payload) => route_response(&listener_pending, &listener_id, payload),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "client: response stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("client: response channel closed");
        });
        info!(%requester_id, "client: started");

        Ok(Self { bus, requester_id, config, pending, task: Some(task) })
    }

    #[must_use]
    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    /// Number of calls still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        match self.pending.lock() {
            Ok(calls) => calls.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Ask any running service to add `condition` to the token, optionally
    /// labelling the marker with `value`.
    ///
    /// # Errors
    ///
    /// `API_TIMEOUT` if no response arrives in time, or a bus error.
    pub async fn add_condition(
        &self,
        token_id: &str,
        condition: &str,
        value: Option<&str>,
    ) -> Result<ActionResponse, ClientError> {
        self.call(Action::Add, token_id, condition, value.map(str::to_string))
            .await
    }

    /// Ask any running service to remove `condition` from the token.
    ///
    /// # Errors
    ///
    /// `API_TIMEOUT` if no response arrives in time, or a bus error.
    pub async fn remove_condition(&self, token_id: &str, condition: &str) -> Result<ActionResponse, ClientError> {
        self.call(Action::Remove, token_id, condition, None).await
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    ///
    /// `API_TIMEOUT` if no response arrives in time, `ListenerClosed` if the
    /// client was stopped mid-call, or a bus error.
    pub async fn call(
        &self,
        action: Action,
        token_id: &str,
        condition: &str,
        value: Option<String>,
    ) -> Result<ActionResponse, ClientError> {
        let ctx = CallContext { call_id: new_call_id(), requester_id: self.requester_id.clone() };
        let (tx, rx) = oneshot::channel();
        self.lock_pending()?.insert(ctx.call_id.clone(), tx);
        let _guard = PendingGuard { pending: &self.pending, call_id: &ctx.call_id };

        let request = RawRequest::new(&ctx, action, token_id, condition, value);
        let payload = serde_json::to_value(&request).map_err(BusError::from)?;
        self.bus.send(&self.config.request_channel, payload).await?;
        debug!(call_id = %ctx.call_id, ?action, token_id, condition, "client: sent");

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::ListenerClosed),
            Err(_) => {
                error!(call_id = %ctx.call_id, token_id, condition, "client: timeout waiting for response");
                Err(ActionError::Timeout { call_id: ctx.call_id.clone(), timeout_ms: self.config.request_timeout_ms }.into())
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(requester_id = %self.requester_id, "client: stopped");
        }
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, HashMap<String, oneshot::Sender<ActionResponse>>>, ClientError> {
        self.pending.lock().map_err(|_| ClientError::Poisoned)
    }
}

impl Drop for ActionClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hand a response to its waiter, if it is ours and someone is waiting.
fn route_response(pending: &PendingCalls, requester_id: &str, payload: serde_json::Value) {
    let response: ActionResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "client: ignoring malformed response");
            return;
        }
    };
    if response.requester_id != requester_id {
        return;
    }
    let waiter = match pending.lock() {
        Ok(mut calls) => calls.remove(&response.call_id),
        Err(poisoned) => poisoned.into_inner().remove(&response.call_id),
    };
    let Some(waiter) = waiter else {
        debug!(call_id = %response.call_id, "client: no waiter for response");
        return;
    };
    if waiter.send(response).is_err() {
        debug!("client: caller abandoned call before response arrived");
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
