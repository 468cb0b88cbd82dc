//! Marker synchronizer — keeps markers glued to their tokens.
//!
//! DESIGN
//! ======
//! Every store change batch is reduced to the set of tokens it touched:
//! tokens that changed, plus the parents of markers that were added,
//! updated, or removed. For each such token the full marker layout is
//! recomputed from scratch and diffed against the store. Whatever differs
//! goes out as one batched update.
//!
//! Recomputing from the authoritative store instead of applying deltas is
//! what lets independent clients converge: a lost protocol response or a
//! reordered mutation is corrected by the next change event. The update we
//! issue produces its own change event, which plans to nothing, so the loop
//! settles after one round.
//!
//! SLOTS
//! =====
//! Siblings are ranked by `(stored slot, id)` and assigned dense ordinals.
//! Two clients that raced to the same slot resolve identically everywhere;
//! gaps left by removals close up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::layout::{self, LayoutError, MarkerPlacement, TokenTransform};
use crate::protocol::ErrorCode;
use crate::scene::{AttachmentBehavior, ItemId, SceneChange, SceneItem, SceneStore, StoreError, Vector2};

/// Floating tolerance for deciding a marker is already in place.
pub const LAYOUT_TOLERANCE: f64 = 1e-6;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Layout(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Layout(_) => false,
        }
    }
}

/// Target state for one marker that is out of place.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerUpdate {
    pub id: ItemId,
    pub position: Vector2,
    pub scale: Vector2,
    pub slot: usize,
}

// =============================================================================
// PLANNING
// =============================================================================

/// Plan updates for the markers on one token. `markers` may contain items
/// from other tokens; they are ignored.
///
/// # Errors
///
/// Returns a `LayoutError` if the token or scene resolution is invalid.
pub fn plan_token(
    token: &TokenTransform,
    markers: &[SceneItem],
    scene_dpi: f64,
) -> Result<Vec<MarkerUpdate>, LayoutError> {
    let mut siblings: Vec<(usize, &SceneItem)> = markers
        .iter()
        .filter(|m| m.is_marker_on(token.id))
        .filter_map(|m| m.marker().map(|meta| (meta.slot, m)))
        .collect();
    siblings.sort_by(|(a_slot, a), (b_slot, b)| a_slot.cmp(b_slot).then_with(|| a.id.cmp(&b.id)));

    let mut updates = Vec::new();
    for (rank, (_, marker)) in siblings.into_iter().enumerate() {
        let placement = layout::place_marker(token, rank, scene_dpi)?;
        if needs_update(marker, &placement, rank) {
            updates.push(MarkerUpdate { id: marker.id, position: placement.position, scale: placement.scale, slot: rank });
        }
    }
    Ok(updates)
}

fn needs_update(marker: &SceneItem, placement: &MarkerPlacement, slot: usize) -> bool {
    let slot_matches = marker.marker().is_some_and(|m| m.slot == slot);
    let detached = marker
        .disable_attachment_behavior
        .contains(&AttachmentBehavior::Rotation)
        && marker
            .disable_attachment_behavior
            .contains(&AttachmentBehavior::Scale);

    !(slot_matches
        && detached
        && marker.rotation.abs() <= LAYOUT_TOLERANCE
        && marker.position.approx_eq(placement.position, LAYOUT_TOLERANCE)
        && marker.scale.approx_eq(placement.scale, LAYOUT_TOLERANCE))
}

/// Tokens whose marker layout may be stale after `change`, in first-seen order.
#[must_use]
pub fn affected_tokens(change: &SceneChange) -> Vec<ItemId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let touched = change.items.iter().chain(change.removed.iter());
    for item in touched {
        let token_id = if item.metadata.marker.is_some() {
            item.attached_to
        } else if item.is_token() {
            Some(item.id)
        } else {
            None
        };
        if let Some(id) = token_id {
            if seen.insert(id) {
                out.push(id);
            }
        }
    }
    // Removed tokens take their markers with them.
    let gone: HashSet<ItemId> = change
        .removed
        .iter()
        .filter(|item| item.is_token())
        .map(|item| item.id)
        .collect();
    out.retain(|id| !gone.contains(id));
    out
}

// =============================================================================
// APPLY
// =============================================================================

/// Recompute and apply marker layout for `token_ids`. Issues at most one
/// store update. Returns the number of markers updated.
///
/// Tokens with unusable geometry are logged and skipped.
///
/// # Errors
///
/// Returns a store error if a query or the batched update fails.
pub async fn reposition(store: &dyn SceneStore, token_ids: &[ItemId]) -> Result<usize, SyncError> {
    if token_ids.is_empty() {
        return Ok(0);
    }
    let wanted: HashSet<ItemId> = token_ids.iter().copied().collect();

    let tokens = store
        .query(&|item: &SceneItem| item.is_token() && wanted.contains(&item.id))
        .await?;
    let markers = store
        .query(&|item: &SceneItem| item.marker().is_some() && item.attached_to.is_some_and(|p| wanted.contains(&p)))
        .await?;
    if markers.is_empty() {
        return Ok(0);
    }
    let scene_dpi = store.grid_dpi().await?;

    let mut plan = Vec::new();
    for token in &tokens {
        let planned = TokenTransform::from_item(token).and_then(|t| plan_token(&t, &markers, scene_dpi));
        match planned {
            Ok(updates) => plan.extend(updates),
            Err(e) => warn!(token_id = %token.id, error = %e, "sync: skipping token with invalid geometry"),
        }
    }

    apply_plan(store, plan).await
}

/// Recompute layout for every token that carries a marker.
///
/// # Errors
///
/// Returns a store error if a query or the batched update fails.
pub async fn reposition_all(store: &dyn SceneStore) -> Result<usize, SyncError> {
    let markers = store.query(&|item: &SceneItem| item.marker().is_some()).await?;
    let mut seen = HashSet::new();
    let token_ids: Vec<ItemId> = markers
        .iter()
        .filter_map(|m| m.attached_to)
        .filter(|id| seen.insert(*id))
        .collect();
    reposition(store, &token_ids).await
}

/// Handle one change batch.
///
/// # Errors
///
/// Returns a store error if a query or the batched update fails.
pub async fn handle_change(store: &dyn SceneStore, change: &SceneChange) -> Result<usize, SyncError> {
    reposition(store, &affected_tokens(change)).await
}

async fn apply_plan(store: &dyn SceneStore, plan: Vec<MarkerUpdate>) -> Result<usize, SyncError> {
    if plan.is_empty() {
        return Ok(0);
    }
    let ids: Vec<ItemId> = plan.iter().map(|u| u.id).collect();
    let by_id: HashMap<ItemId, MarkerUpdate> = plan.into_iter().map(|u| (u.id, u)).collect();

    let mut applied = 0usize;
    let mut mutator = |items: &mut [SceneItem]| {
        for item in items.iter_mut() {
            let Some(update) = by_id.get(&item.id) else {
                error!(item_id = %item.id, "sync: marker id mismatch, skipping item");
                continue;
            };
            item.position = update.position;
            item.rotation = 0.0;
            item.scale = update.scale;
            for behavior in [AttachmentBehavior::Rotation, AttachmentBehavior::Scale] {
                if !item.disable_attachment_behavior.contains(&behavior) {
                    item.disable_attachment_behavior.push(behavior);
                }
            }
            if let Some(meta) = item.metadata.marker.as_mut() {
                meta.slot = update.slot;
            }
            applied += 1;
        }
    };
    store.update(&ids, &mut mutator).await?;
    Ok(applied)
}

// =============================================================================
// BACKGROUND TASK
// =============================================================================

/// Runs the synchronizer against a store's change stream.
pub struct MarkerSync {
    store: Arc<dyn SceneStore>,
    task: Option<JoinHandle<()>>,
}

impl MarkerSync {
    #[must_use]
    pub fn new(store: Arc<dyn SceneStore>) -> Self {
        Self { store, task: None }
    }

    /// Subscribe to the store and start reacting to changes. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let mut changes = store.subscribe();
        self.task = Some(tokio::spawn(async move {
            loop {
                let outcome = match changes.recv().await {
                    Ok(change) => handle_change(store.as_ref(), &change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: change stream lagged, relaying out every token");
                        reposition_all(store.as_ref()).await
                    }
                    Err(RecvError::Closed) => break,
                };
                match outcome {
                    Ok(0) => {}
                    Ok(updated) => debug!(updated, "sync: markers repositioned"),
                    Err(e) => warn!(error = %e, "sync: reposition failed"),
                }
            }
            info!("sync: change stream closed");
        }));
        info!("sync: started");
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("sync: stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for MarkerSync {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
