//! Action service — answers add/remove requests from other extensions.
//!
//! DESIGN
//! ======
//! The service listens on the request channel and walks every payload
//! through RECEIVED → VALIDATED → EXECUTED → RESPONDED, or
//! RECEIVED → REJECTED → RESPONDED. `handle_payload` is pure business
//! logic that returns the response; the listener loop owns sending it.
//!
//! ERROR HANDLING
//! ==============
//! Nothing escapes the request boundary. Validation failures carry a
//! protocol code; execution failures become `ok: false` with the error's
//! text. A payload with no `callId`/`requesterId` cannot be answered and is
//! dropped with a warning. The listener survives every failure, including
//! failures to send the response.
//!
//! IDEMPOTENCY
//! ===========
//! Delivery is at-least-once and several clients may run the service. An
//! `add` for a condition the token already carries answers
//! `alreadyPresent` without touching the store; a `remove` with nothing to
//! remove answers `deleted: 0`.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::label::{LabelError, LabelManager};
use super::layout::{self, LayoutError};
use super::sync::{self, SyncError};
use crate::bus::{BusError, Broadcast};
use crate::config::MarkerConfig;
use crate::protocol::{ActionError, ActionRequest, ActionResponse, CallContext, ErrorCode, RawRequest};
use crate::scene::{ItemId, MarkerIndex, SceneItem, SceneStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

/// Failures while executing a validated request.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("label error: {0}")]
    Label(#[from] LabelError),
    #[error("reposition error: {0}")]
    Sync(#[from] SyncError),
}

impl ErrorCode for ExecuteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Layout(e) => e.error_code(),
            Self::Label(e) => e.error_code(),
            Self::Sync(e) => e.error_code(),
        }
    }
}

/// Everything a request handler needs. Shared with the listener task.
struct ServiceInner {
    store: Arc<dyn SceneStore>,
    bus: Arc<dyn Broadcast>,
    labels: LabelManager,
    config: MarkerConfig,
}

pub struct ActionService {
    inner: Arc<ServiceInner>,
    task: Option<JoinHandle<()>>,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl ActionService {
    #[must_use]
    pub fn new(
        store: Arc<dyn SceneStore>,
        bus: Arc<dyn Broadcast>,
        labels: LabelManager,
        config: MarkerConfig,
    ) -> Self {
        Self { inner: Arc::new(ServiceInner { store, bus, labels, config }), task: None }
    }

    /// Subscribe to the request channel and start answering. Idempotent.
    ///
    /// The subscription is taken before this returns, so requests sent
    /// afterwards are never missed.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the request channel cannot be subscribed.
    pub fn start(&mut self) -> Result<(), BusError> {
        if self.task.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let mut requests = inner.bus.subscribe(&inner.config.request_channel)?;
        self.task = Some(tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(payload) => inner.serve(payload).await,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "api: request stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            info!("api: request channel closed");
        }));
        info!(channel = %self.inner.config.request_channel, "api: listening");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("api: stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Process one raw payload and return the response to broadcast, if
    /// the payload is answerable.
    pub async fn handle_payload(&self, payload: serde_json::Value) -> Option<ActionResponse> {
        self.inner.handle_payload(payload).await
    }
}

impl Drop for ActionService {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// REQUEST HANDLING
// =============================================================================

impl ServiceInner {
    async fn serve(&self, payload: serde_json::Value) {
        let Some(response) = self.handle_payload(payload).await else {
            return;
        };
        let call_id = response.call_id.clone();
        let encoded = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                error!(%call_id, error = %e, "api: response encode failed");
                return;
            }
        };
        match self.bus.send(&self.config.response_channel, encoded).await {
            Ok(()) => debug!(%call_id, ok = response.ok, "api: responded"),
            Err(e) => error!(%call_id, error = %e, "api: response send failed"),
        }
    }

    async fn handle_payload(&self, payload: serde_json::Value) -> Option<ActionResponse> {
        let req: RawRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "api: malformed request payload");
                return None;
            }
        };
        let Some(ctx) = req.context() else {
            warn!(?req, "api: request without callId/requesterId, dropping");
            return None;
        };
        debug!(call_id = %ctx.call_id, requester_id = %ctx.requester_id, action = ?req.action, "api: received");

        let base = ActionResponse::to(&req, &ctx);
        let action = match req.validate() {
            Ok(action) => action,
            Err(e) => {
                info!(call_id = %ctx.call_id, code = e.error_code(), "api: rejected");
                return Some(base.failed(&e));
            }
        };

        Some(match self.execute(&action, &ctx, base.clone()).await {
            Ok(response) => response,
            Err(e) => {
                error!(call_id = %ctx.call_id, code = e.error_code(), error = %e, "api: execution failed");
                base.failed(&e)
            }
        })
    }

    async fn execute(
        &self,
        action: &ActionRequest,
        ctx: &CallContext,
        base: ActionResponse,
    ) -> Result<ActionResponse, ActionError> {
        let token_id = action.token_id();
        let token = self
            .find_token(token_id)
            .await
            .map_err(|e| ActionError::Unexpected(e.to_string()))?
            .ok_or_else(|| ActionError::TokenNotFound(token_id.to_string()))?;

        let result = match action {
            ActionRequest::Add { condition, value, .. } => self.add(&token, condition, value.as_deref(), base).await,
            ActionRequest::Remove { condition, .. } => self.remove(&token, condition, base).await,
        };
        let response = result.map_err(|e| ActionError::Unexpected(e.to_string()))?;
        info!(
            call_id = %ctx.call_id,
            %token_id,
            condition = action.condition(),
            added = ?response.added,
            already_present = ?response.already_present,
            deleted = ?response.deleted,
            "api: executed"
        );
        Ok(response)
    }

    async fn find_token(&self, token_id: ItemId) -> Result<Option<SceneItem>, StoreError> {
        let mut found = self
            .store
            .query(&|item: &SceneItem| item.id == token_id && item.is_token())
            .await?;
        Ok(found.pop())
    }

    async fn markers_on(&self, token_id: ItemId) -> Result<MarkerIndex, StoreError> {
        let markers = self
            .store
            .query(&|item: &SceneItem| item.is_marker_on(token_id))
            .await?;
        Ok(MarkerIndex::build(markers))
    }

    async fn add(
        &self,
        token: &SceneItem,
        condition: &str,
        value: Option<&str>,
        base: ActionResponse,
    ) -> Result<ActionResponse, ExecuteError> {
        let index = self.markers_on(token.id).await?;
        if index.contains(token.id, condition) {
            return Ok(base.already_present());
        }

        let slot = index.siblings(token.id).len();
        let scene_dpi = self.store.grid_dpi().await?;
        let marker = layout::build_marker(condition, token, slot, scene_dpi, &self.config.asset_base_url)?;
        self.store.add(vec![marker]).await?;

        if let Some(text) = value {
            self.labels
                .set_label_for_token(token.id, condition, text)
                .await?;
        }
        sync::reposition(self.store.as_ref(), &[token.id]).await?;
        Ok(base.added())
    }

    async fn remove(&self, token: &SceneItem, condition: &str, base: ActionResponse) -> Result<ActionResponse, ExecuteError> {
        let index = self.markers_on(token.id).await?;
        let doomed: Vec<ItemId> = index
            .lookup(token.id, condition)
            .iter()
            .map(|m| m.id)
            .collect();
        if doomed.is_empty() {
            return Ok(base.deleted(0));
        }

        self.store.delete(&doomed).await?;
        sync::reposition(self.store.as_ref(), &[token.id]).await?;
        Ok(base.deleted(doomed.len()))
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
