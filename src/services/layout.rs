//! Marker layout — pure geometry from token transform to marker placement.
//!
//! DESIGN
//! ======
//! Markers stack in a single vertical column to the left of their token,
//! axis-aligned regardless of token rotation. Slot `i` sits at marker-grid
//! cell `(-1, i)`, where one cell is a quarter of the token image width,
//! the same size as a marker at unit scale, so neighbors touch but never
//! overlap.
//!
//! The token's scale is applied by magnitude only. A mirrored token keeps
//! its markers on the same side and unflipped.
//!
//! Every function here is pure: identical inputs give identical outputs.

use uuid::Uuid;

use crate::scene::{
    AttachmentBehavior, ImageContent, ImageGrid, ImageInfo, ItemContent, ItemId, ItemMetadata, Layer,
    MARKER_NAME_PREFIX, MarkerMetadata, SceneItem, Vector2,
};

/// Side length of a marker at unit token scale, in grid cells.
pub const MARKER_GRID_SIZE: f64 = 0.25;

/// Marker-grid cells per token image width.
pub const MARKER_CELLS_PER_TOKEN: f64 = 1.0 / MARKER_GRID_SIZE;

/// Floor applied to each token scale magnitude.
pub const MIN_SCALE_MAGNITUDE: f64 = 1e-6;

/// Marker-grid column the stack occupies, relative to the token.
const MARKER_COLUMN: f64 = -1.0;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("invalid {what}: {value}")]
    Format { what: &'static str, value: f64 },
    #[error("item {0} is not an image")]
    NotAnImage(ItemId),
}

impl crate::protocol::ErrorCode for LayoutError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Format { .. } => "E_LAYOUT_FORMAT",
            Self::NotAnImage(_) => "E_LAYOUT_NOT_IMAGE",
        }
    }
}

/// The parts of a token the layout depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenTransform {
    pub id: ItemId,
    pub position: Vector2,
    /// Carried for completeness; markers ignore it.
    pub rotation: f64,
    pub scale: Vector2,
    pub image_width: f64,
    pub grid: ImageGrid,
    pub visible: bool,
}

impl TokenTransform {
    /// Extract the transform of an image item.
    ///
    /// # Errors
    ///
    /// Returns `NotAnImage` for text items.
    pub fn from_item(item: &SceneItem) -> Result<Self, LayoutError> {
        let image = item.image().ok_or(LayoutError::NotAnImage(item.id))?;
        Ok(Self {
            id: item.id,
            position: item.position,
            rotation: item.rotation,
            scale: item.scale,
            image_width: image.image.width,
            grid: image.grid,
            visible: item.visible,
        })
    }
}

/// Where and how large a marker is drawn. Rotation is always zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerPlacement {
    pub position: Vector2,
    pub scale: Vector2,
    pub rotation: f64,
}

// =============================================================================
// PLACEMENT
// =============================================================================

/// Compute the placement of the marker in `slot` on `token`.
///
/// # Errors
///
/// Returns `Format` if `scene_dpi` or the token grid dpi is zero, negative,
/// or not finite, or if the token geometry itself is not finite.
pub fn place_marker(token: &TokenTransform, slot: usize, scene_dpi: f64) -> Result<MarkerPlacement, LayoutError> {
    let scene_dpi = check_resolution("scene grid dpi", scene_dpi)?;
    let token_dpi = check_resolution("token grid dpi", token.grid.dpi)?;
    check_finite("token image width", token.image_width)?;
    if !token.position.is_finite() || !token.grid.offset.is_finite() {
        return Err(LayoutError::Format { what: "token position", value: f64::NAN });
    }

    let magnitude = scale_magnitude(token.scale)?;
    let cell = token.image_width / MARKER_CELLS_PER_TOKEN;

    let position = slot_cell(slot)
        .scaled(cell)
        .sub(token.grid.offset)
        .scaled(scene_dpi / token_dpi)
        .mul(magnitude)
        .add(token.position);

    Ok(MarkerPlacement { position, scale: marker_scale_from(magnitude, token.image_width, token_dpi), rotation: 0.0 })
}

/// Marker scale for `token`: `|scale| × (image width / grid dpi)`.
///
/// # Errors
///
/// Returns `Format` for an invalid token grid dpi or non-finite scale.
pub fn marker_scale(token: &TokenTransform) -> Result<Vector2, LayoutError> {
    let token_dpi = check_resolution("token grid dpi", token.grid.dpi)?;
    check_finite("token image width", token.image_width)?;
    Ok(marker_scale_from(scale_magnitude(token.scale)?, token.image_width, token_dpi))
}

fn marker_scale_from(magnitude: Vector2, image_width: f64, token_dpi: f64) -> Vector2 {
    magnitude.scaled(image_width / token_dpi)
}

/// Marker-grid cell for `slot`, in cell units.
#[must_use]
pub fn slot_cell(slot: usize) -> Vector2 {
    #[allow(clippy::cast_precision_loss)]
    let row = slot as f64;
    Vector2::new(MARKER_COLUMN, row)
}

/// Absolute token scale with each component floored at `MIN_SCALE_MAGNITUDE`.
fn scale_magnitude(scale: Vector2) -> Result<Vector2, LayoutError> {
    check_finite("token scale", scale.x)?;
    check_finite("token scale", scale.y)?;
    let abs = scale.abs();
    Ok(Vector2::new(abs.x.max(MIN_SCALE_MAGNITUDE), abs.y.max(MIN_SCALE_MAGNITUDE)))
}

fn check_resolution(what: &'static str, value: f64) -> Result<f64, LayoutError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(LayoutError::Format { what, value })
    }
}

fn check_finite(what: &'static str, value: f64) -> Result<f64, LayoutError> {
    if value.is_finite() { Ok(value) } else { Err(LayoutError::Format { what, value }) }
}

// =============================================================================
// MARKER ITEMS
// =============================================================================

/// Asset key for a condition: lower-cased, `'` and `-` dropped, spaces to `_`.
#[must_use]
pub fn condition_asset_key(condition: &str) -> String {
    condition
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '-')
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

#[must_use]
pub fn condition_image_url(asset_base_url: &str, condition: &str) -> String {
    format!("{}/images/{}.webp", asset_base_url.trim_end_matches('/'), condition_asset_key(condition))
}

/// Build a new marker item for `condition` in `slot` on `token`.
///
/// The marker image is `scene_dpi` pixels square with a grid dpi chosen so
/// it spans `MARKER_GRID_SIZE` cells at unit scale, anchored at its
/// left-middle edge.
///
/// # Errors
///
/// Returns `NotAnImage` if `token` is not an image, or `Format` for invalid
/// resolutions.
pub fn build_marker(
    condition: &str,
    token: &SceneItem,
    slot: usize,
    scene_dpi: f64,
    asset_base_url: &str,
) -> Result<SceneItem, LayoutError> {
    let transform = TokenTransform::from_item(token)?;
    let placement = place_marker(&transform, slot, scene_dpi)?;

    Ok(SceneItem {
        id: Uuid::new_v4(),
        name: format!("{MARKER_NAME_PREFIX}{condition}"),
        layer: Layer::Attachment,
        position: placement.position,
        rotation: placement.rotation,
        scale: placement.scale,
        visible: transform.visible,
        locked: true,
        attached_to: Some(transform.id),
        disable_attachment_behavior: vec![AttachmentBehavior::Rotation, AttachmentBehavior::Scale],
        content: ItemContent::Image(ImageContent {
            image: ImageInfo {
                width: scene_dpi,
                height: scene_dpi,
                mime: "image/webp".into(),
                url: condition_image_url(asset_base_url, condition),
            },
            grid: ImageGrid { offset: Vector2::new(0.0, scene_dpi / 2.0), dpi: scene_dpi / MARKER_GRID_SIZE },
        }),
        metadata: ItemMetadata {
            marker: Some(MarkerMetadata { enabled: true, condition: condition.to_string(), slot }),
            label: None,
        },
    })
}

#[cfg(test)]
#[path = "layout_test.rs"]
mod tests;
