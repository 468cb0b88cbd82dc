//! In-process scene store and player.
//!
//! DESIGN
//! ======
//! `MemoryScene` keeps items in document order behind a tokio `RwLock` and
//! fans out one `SceneChange` per committed batch over a broadcast channel.
//! Deleting an item also deletes everything attached to it, transitively,
//! matching how the shared document cascades attachments.
//!
//! `update` touches only the requested items. Attachments keep their own
//! transform when their parent changes; `disable_attachment_behavior` is
//! stored as data and left for callers to honor.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{ItemFilter, ItemId, ItemMutator, Player, SceneChange, SceneItem, SceneStore, StoreError};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// MEMORY SCENE
// =============================================================================

pub struct MemoryScene {
    items: RwLock<Vec<SceneItem>>,
    grid_dpi: RwLock<f64>,
    changes: broadcast::Sender<SceneChange>,
}

impl MemoryScene {
    #[must_use]
    pub fn new(grid_dpi: f64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { items: RwLock::new(Vec::new()), grid_dpi: RwLock::new(grid_dpi), changes }
    }

    /// Insert items without emitting a change notification.
    pub async fn seed(&self, items: Vec<SceneItem>) {
        self.items.write().await.extend(items);
    }

    /// Snapshot of every item in document order.
    pub async fn snapshot(&self) -> Vec<SceneItem> {
        self.items.read().await.clone()
    }

    /// Look up one item by id.
    pub async fn get(&self, id: ItemId) -> Option<SceneItem> {
        self.items
            .read()
            .await
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub async fn set_grid_dpi(&self, dpi: f64) {
        *self.grid_dpi.write().await = dpi;
    }

    fn publish(&self, change: SceneChange) {
        // No subscribers is not an error.
        if self.changes.send(change).is_err() {
            debug!("scene: change dropped, no subscribers");
        }
    }
}

#[async_trait]
impl SceneStore for MemoryScene {
    async fn query(&self, filter: ItemFilter<'_>) -> Result<Vec<SceneItem>, StoreError> {
        let items = self.items.read().await;
        Ok(items.iter().filter(|item| filter(item)).cloned().collect())
    }

    async fn add(&self, new_items: Vec<SceneItem>) -> Result<(), StoreError> {
        if new_items.is_empty() {
            return Ok(());
        }
        {
            let mut items = self.items.write().await;
            for item in &new_items {
                if items.iter().any(|existing| existing.id == item.id) {
                    return Err(StoreError::Rejected(format!("duplicate item id {}", item.id)));
                }
            }
            items.extend(new_items.iter().cloned());
        }
        self.publish(SceneChange { items: new_items, removed: Vec::new() });
        Ok(())
    }

    async fn update(&self, ids: &[ItemId], mutator: ItemMutator<'_>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let changed = {
            let mut items = self.items.write().await;
            let mut batch: Vec<SceneItem> = ids
                .iter()
                .filter_map(|id| items.iter().find(|item| item.id == *id).cloned())
                .collect();
            mutator(&mut batch);

            let mut changed = Vec::with_capacity(batch.len());
            for updated in batch {
                let Some(slot) = items.iter_mut().find(|item| item.id == updated.id) else {
                    continue;
                };
                if *slot != updated {
                    *slot = updated.clone();
                    changed.push(updated);
                }
            }
            changed
        };
        if !changed.is_empty() {
            self.publish(SceneChange { items: changed, removed: Vec::new() });
        }
        Ok(())
    }

    async fn delete(&self, ids: &[ItemId]) -> Result<(), StoreError> {
        let removed = {
            let mut items = self.items.write().await;
            let mut doomed: HashSet<ItemId> = ids.iter().copied().collect();
            // Cascade to attachments until no new ids are found.
            loop {
                let before = doomed.len();
                for item in items.iter() {
                    if item.attached_to.is_some_and(|parent| doomed.contains(&parent)) {
                        doomed.insert(item.id);
                    }
                }
                if doomed.len() == before {
                    break;
                }
            }
            let (removed, kept): (Vec<SceneItem>, Vec<SceneItem>) =
                items.drain(..).partition(|item| doomed.contains(&item.id));
            *items = kept;
            removed
        };
        if !removed.is_empty() {
            self.publish(SceneChange { items: Vec::new(), removed });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SceneChange> {
        self.changes.subscribe()
    }

    async fn grid_dpi(&self) -> Result<f64, StoreError> {
        Ok(*self.grid_dpi.read().await)
    }
}

// =============================================================================
// LOCAL PLAYER
// =============================================================================

pub struct LocalPlayer {
    id: String,
    selection: RwLock<Vec<ItemId>>,
}

impl LocalPlayer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), selection: RwLock::new(Vec::new()) }
    }

    pub async fn select(&self, ids: Vec<ItemId>) {
        *self.selection.write().await = ids;
    }
}

#[async_trait]
impl Player for LocalPlayer {
    async fn id(&self) -> Result<String, StoreError> {
        Ok(self.id.clone())
    }

    async fn selection(&self) -> Result<Vec<ItemId>, StoreError> {
        Ok(self.selection.read().await.clone())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
