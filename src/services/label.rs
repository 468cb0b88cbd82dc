//! Label service — one text overlay per marker, created or overwritten.
//!
//! DESIGN
//! ======
//! Labels are text items attached to a marker and tagged with label
//! metadata. Setting a label resolves the target markers, finds any label
//! already attached to each (first one wins if a race left several), and
//! overwrites it; markers without one get a new label. Updates and
//! creations are each sent as one batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::ErrorCode;
use crate::scene::{
    ItemContent, ItemId, ItemMetadata, LabelMetadata, Layer, Player, SceneItem, SceneStore, StoreError, TextAlign,
    TextAlignVertical, TextContent, Vector2,
};

/// Marker size, in grid cells, that maps to `BASELINE_FONT_SIZE`.
pub const BASELINE_GRID_SIZE: f64 = 0.25;

/// Font size for a marker of `BASELINE_GRID_SIZE` cells.
pub const BASELINE_FONT_SIZE: f64 = 18.0;

const LABEL_FILL: &str = "#ffffff";
const LABEL_STROKE: &str = "#000000";
const LABEL_STROKE_WIDTH: f64 = 4.0;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ErrorCode for LabelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
        }
    }
}

/// How many labels a call touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelOutcome {
    pub created: usize,
    pub updated: usize,
}

impl LabelOutcome {
    #[must_use]
    pub fn total(self) -> usize {
        self.created + self.updated
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Font size proportional to the marker's displayed size in grid cells.
///
/// Displayed size is `(image width / grid dpi) × mean(|scale.x|, |scale.y|)`.
/// Returns the baseline size for non-image items.
#[must_use]
pub fn label_font_size(marker: &SceneItem) -> f64 {
    let Some(image) = marker.image() else {
        return BASELINE_FONT_SIZE;
    };
    if !(image.grid.dpi.is_finite() && image.grid.dpi > 0.0) {
        return BASELINE_FONT_SIZE;
    }
    let mean_scale = (marker.scale.x.abs() + marker.scale.y.abs()) / 2.0;
    let grid_size = (image.image.width / image.grid.dpi) * mean_scale;
    (grid_size / BASELINE_GRID_SIZE) * BASELINE_FONT_SIZE
}

/// Build a new label attached to `marker`, anchored at its position.
#[must_use]
pub fn build_label(marker: &SceneItem, condition: &str, text: &str) -> SceneItem {
    SceneItem {
        id: Uuid::new_v4(),
        name: format!("{condition} label"),
        layer: Layer::Attachment,
        position: marker.position,
        rotation: 0.0,
        scale: Vector2::new(1.0, 1.0),
        visible: marker.visible,
        locked: true,
        attached_to: Some(marker.id),
        disable_attachment_behavior: Vec::new(),
        content: ItemContent::Text(TextContent {
            plain_text: text.to_string(),
            font_size: label_font_size(marker),
            text_align: TextAlign::Center,
            text_align_vertical: TextAlignVertical::Middle,
            fill_color: LABEL_FILL.into(),
            stroke_color: LABEL_STROKE.into(),
            stroke_width: LABEL_STROKE_WIDTH,
        }),
        metadata: ItemMetadata { marker: None, label: Some(LabelMetadata { condition: condition.to_string() }) },
    }
}

// =============================================================================
// LABEL MANAGER
// =============================================================================

#[derive(Clone)]
pub struct LabelManager {
    store: Arc<dyn SceneStore>,
    player: Arc<dyn Player>,
}

impl LabelManager {
    #[must_use]
    pub fn new(store: Arc<dyn SceneStore>, player: Arc<dyn Player>) -> Self {
        Self { store, player }
    }

    /// Set the label on the `condition` marker of one token.
    ///
    /// No marker, or a nil token id, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a store error if a query or mutation fails.
    pub async fn set_label_for_token(
        &self,
        token_id: ItemId,
        condition: &str,
        text: &str,
    ) -> Result<LabelOutcome, LabelError> {
        if token_id.is_nil() {
            debug!(condition, "label: no token id, skipping");
            return Ok(LabelOutcome::default());
        }
        let markers = self
            .store
            .query(&|item: &SceneItem| item.is_marker_for(token_id, condition))
            .await?;
        self.apply(&markers, condition, text).await
    }

    /// Set the label on the `condition` marker of every selected token.
    ///
    /// # Errors
    ///
    /// Returns a store error if the selection, a query, or a mutation fails.
    pub async fn set_label_for_selection(&self, condition: &str, text: &str) -> Result<LabelOutcome, LabelError> {
        let selection: HashSet<ItemId> = self.player.selection().await?.into_iter().collect();
        if selection.is_empty() {
            return Ok(LabelOutcome::default());
        }
        let markers = self
            .store
            .query(&|item: &SceneItem| {
                item.attached_to
                    .is_some_and(|parent| selection.contains(&parent) && item.is_marker_for(parent, condition))
            })
            .await?;
        self.apply(&markers, condition, text).await
    }

    async fn apply(&self, markers: &[SceneItem], condition: &str, text: &str) -> Result<LabelOutcome, LabelError> {
        if markers.is_empty() {
            debug!(condition, "label: no matching markers");
            return Ok(LabelOutcome::default());
        }
        let marker_ids: HashSet<ItemId> = markers.iter().map(|m| m.id).collect();
        let existing = self
            .store
            .query(&|item: &SceneItem| {
                item.label().is_some() && item.attached_to.is_some_and(|parent| marker_ids.contains(&parent))
            })
            .await?;

        // First label seen per marker wins.
        let mut by_marker: HashMap<ItemId, ItemId> = HashMap::new();
        for label in &existing {
            if let Some(parent) = label.attached_to {
                by_marker.entry(parent).or_insert(label.id);
            }
        }

        let mut to_update = Vec::new();
        let mut to_create = Vec::new();
        for marker in markers {
            match by_marker.get(&marker.id) {
                Some(label_id) => to_update.push(*label_id),
                None => to_create.push(build_label(marker, condition, text)),
            }
        }

        let mut outcome = LabelOutcome { created: to_create.len(), updated: 0 };
        if !to_update.is_empty() {
            let mut updated = 0usize;
            let mut mutator = |items: &mut [SceneItem]| {
                for item in items.iter_mut() {
                    let Some(body) = item.text_mut() else {
                        continue;
                    };
                    body.plain_text = text.to_string();
                    match item.metadata.label.as_mut() {
                        Some(meta) => meta.condition = condition.to_string(),
                        None => item.metadata.label = Some(LabelMetadata { condition: condition.to_string() }),
                    }
                    updated += 1;
                }
            };
            self.store.update(&to_update, &mut mutator).await?;
            outcome.updated = updated;
        }
        if !to_create.is_empty() {
            self.store.add(to_create).await?;
        }

        info!(condition, created = outcome.created, updated = outcome.updated, "label: applied");
        Ok(outcome)
    }
}

#[cfg(test)]
#[path = "label_test.rs"]
mod tests;
