//! Scene model — items, tokens, markers, labels, and the store seam.
//!
//! DESIGN
//! ======
//! The shared scene document is owned by an external collaborator. This
//! module defines the item shape we read and write, plus the traits the
//! rest of the crate talks to: `SceneStore` for items and change
//! notifications, `Player` for the local participant's identity and
//! selection. `MemoryScene` is the in-process implementation used by the
//! sandbox binary and the tests.
//!
//! Condition identity is an explicit `MarkerMetadata::condition` field.
//! The display name `"Condition Marker - {condition}"` is cosmetic.

pub mod index;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use index::MarkerIndex;
pub use memory::{LocalPlayer, MemoryScene};

/// Unique identifier for a scene item.
pub type ItemId = Uuid;

/// Display-name prefix carried by every marker item.
pub const MARKER_NAME_PREFIX: &str = "Condition Marker - ";

// =============================================================================
// GEOMETRY
// =============================================================================

/// A point or extent in scene space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self { x: self.x + other.x, y: self.y + other.y }
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        Self { x: self.x - other.x, y: self.y - other.y }
    }

    /// Component-wise product.
    #[must_use]
    pub fn mul(self, other: Self) -> Self {
        Self { x: self.x * other.x, y: self.y * other.y }
    }

    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self { x: self.x * factor, y: self.y * factor }
    }

    #[must_use]
    pub fn abs(self) -> Self {
        Self { x: self.x.abs(), y: self.y.abs() }
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// True when both components are within `tolerance` of `other`.
    #[must_use]
    pub fn approx_eq(self, other: Self, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance && (self.y - other.y).abs() <= tolerance
    }
}

// =============================================================================
// ITEM CONTENT
// =============================================================================

/// Scene layer an item is drawn on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    Map,
    Prop,
    Mount,
    Character,
    Attachment,
    Text,
}

/// Parent transform channels an attachment can opt out of inheriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentBehavior {
    Visible,
    Scale,
    Rotation,
    Position,
    Locked,
    Delete,
}

/// Source image dimensions and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: f64,
    pub height: f64,
    pub mime: String,
    pub url: String,
}

/// Image-to-grid mapping: `dpi` image pixels span one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageGrid {
    pub offset: Vector2,
    pub dpi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub image: ImageInfo,
    pub grid: ImageGrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextAlignVertical {
    Top,
    Middle,
    Bottom,
}

/// Plain text body with its styling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub plain_text: String,
    pub font_size: f64,
    pub text_align: TextAlign,
    pub text_align_vertical: TextAlignVertical,
    pub fill_color: String,
    pub stroke_color: String,
    pub stroke_width: f64,
}

/// What an item draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemContent {
    Image(ImageContent),
    Text(TextContent),
}

// =============================================================================
// METADATA
// =============================================================================

/// Marks an image item as a condition marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerMetadata {
    pub enabled: bool,
    pub condition: String,
    /// Layout ordinal among sibling markers on the same token.
    pub slot: usize,
}

/// Marks a text item as a marker label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMetadata {
    pub condition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<MarkerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelMetadata>,
}

// =============================================================================
// SCENE ITEM
// =============================================================================

/// One item in the shared scene document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItem {
    pub id: ItemId,
    pub name: String,
    pub layer: Layer,
    pub position: Vector2,
    /// Clockwise rotation in degrees.
    pub rotation: f64,
    /// Negative components mirror the item.
    pub scale: Vector2,
    pub visible: bool,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<ItemId>,
    #[serde(default)]
    pub disable_attachment_behavior: Vec<AttachmentBehavior>,
    pub content: ItemContent,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl SceneItem {
    #[must_use]
    pub fn image(&self) -> Option<&ImageContent> {
        match &self.content {
            ItemContent::Image(image) => Some(image),
            ItemContent::Text(_) => None,
        }
    }

    #[must_use]
    pub fn text(&self) -> Option<&TextContent> {
        match &self.content {
            ItemContent::Text(text) => Some(text),
            ItemContent::Image(_) => None,
        }
    }

    pub fn text_mut(&mut self) -> Option<&mut TextContent> {
        match &mut self.content {
            ItemContent::Text(text) => Some(text),
            ItemContent::Image(_) => None,
        }
    }

    /// Tokens are character or mount images.
    #[must_use]
    pub fn is_token(&self) -> bool {
        self.image().is_some() && matches!(self.layer, Layer::Character | Layer::Mount)
    }

    /// Marker metadata, only when the item is an enabled marker image.
    #[must_use]
    pub fn marker(&self) -> Option<&MarkerMetadata> {
        if self.image().is_none() {
            return None;
        }
        self.metadata.marker.as_ref().filter(|m| m.enabled)
    }

    /// Enabled marker attached to `token_id`.
    #[must_use]
    pub fn is_marker_on(&self, token_id: ItemId) -> bool {
        self.marker().is_some() && self.attached_to == Some(token_id)
    }

    /// Enabled marker for `condition` attached to `token_id`.
    #[must_use]
    pub fn is_marker_for(&self, token_id: ItemId, condition: &str) -> bool {
        self.is_marker_on(token_id) && self.marker().is_some_and(|m| m.condition == condition)
    }

    /// Label metadata, only when the item is an attached text item.
    #[must_use]
    pub fn label(&self) -> Option<&LabelMetadata> {
        if self.text().is_none() || self.attached_to.is_none() {
            return None;
        }
        self.metadata.label.as_ref()
    }
}

// =============================================================================
// CHANGE NOTIFICATIONS
// =============================================================================

/// One batch of store mutations, delivered to every subscriber.
#[derive(Debug, Clone, Default)]
pub struct SceneChange {
    /// Items added or updated, in their post-mutation state.
    pub items: Vec<SceneItem>,
    /// Items deleted, in their last known state.
    pub removed: Vec<SceneItem>,
}

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("scene store unavailable: {0}")]
    Unavailable(String),
    #[error("scene store rejected mutation: {0}")]
    Rejected(String),
}

impl crate::protocol::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
            Self::Rejected(_) => "E_STORE_REJECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Item filter passed to [`SceneStore::query`].
pub type ItemFilter<'a> = &'a (dyn Fn(&SceneItem) -> bool + Send + Sync);

/// Batch mutator passed to [`SceneStore::update`]. Receives the found items
/// in the order their ids were requested; missing ids are skipped.
pub type ItemMutator<'a> = &'a mut (dyn FnMut(&mut [SceneItem]) + Send);

/// The shared scene document. Implementations own all concurrency control.
#[async_trait]
pub trait SceneStore: Send + Sync {
    /// Return every item matching `filter`, in document order.
    async fn query(&self, filter: ItemFilter<'_>) -> Result<Vec<SceneItem>, StoreError>;

    /// Insert items in one batch.
    async fn add(&self, items: Vec<SceneItem>) -> Result<(), StoreError>;

    /// Apply `mutator` to the items with `ids` in one batch.
    async fn update(&self, ids: &[ItemId], mutator: ItemMutator<'_>) -> Result<(), StoreError>;

    /// Delete items in one batch. Attachments of deleted items go with them.
    async fn delete(&self, ids: &[ItemId]) -> Result<(), StoreError>;

    /// Subscribe to change notifications. Only batches committed after the
    /// call are delivered.
    fn subscribe(&self) -> broadcast::Receiver<SceneChange>;

    /// Scene grid resolution in pixels per cell.
    async fn grid_dpi(&self) -> Result<f64, StoreError>;
}

/// The local participant.
#[async_trait]
pub trait Player: Send + Sync {
    /// Stable identity used as `requesterId` on the wire.
    async fn id(&self) -> Result<String, StoreError>;

    /// Ids of the currently selected items.
    async fn selection(&self) -> Result<Vec<ItemId>, StoreError>;
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
