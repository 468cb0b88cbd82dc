//! Marker lookup keyed by `(token, condition)`.

use std::collections::HashMap;

use super::{ItemId, SceneItem};

/// Snapshot index over enabled markers.
///
/// Built from a store query; never mutated afterwards. Entries keep the
/// document order of the source items so "first seen" is well defined.
#[derive(Debug, Default)]
pub struct MarkerIndex {
    by_condition: HashMap<(ItemId, String), Vec<SceneItem>>,
    by_token: HashMap<ItemId, Vec<SceneItem>>,
}

impl MarkerIndex {
    /// Index every enabled, attached marker in `items`. Other items are ignored.
    #[must_use]
    pub fn build(items: impl IntoIterator<Item = SceneItem>) -> Self {
        let mut index = Self::default();
        for item in items {
            let (Some(token_id), Some(meta)) = (item.attached_to, item.marker()) else {
                continue;
            };
            index
                .by_condition
                .entry((token_id, meta.condition.clone()))
                .or_default()
                .push(item.clone());
            index.by_token.entry(token_id).or_default().push(item);
        }
        index
    }

    /// Markers for `condition` on `token_id`. More than one means a
    /// duplicate slipped in through a race.
    #[must_use]
    pub fn lookup(&self, token_id: ItemId, condition: &str) -> &[SceneItem] {
        self.by_condition
            .get(&(token_id, condition.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, token_id: ItemId, condition: &str) -> bool {
        !self.lookup(token_id, condition).is_empty()
    }

    /// All markers attached to `token_id`.
    #[must_use]
    pub fn siblings(&self, token_id: ItemId) -> &[SceneItem] {
        self.by_token
            .get(&token_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod tests;
