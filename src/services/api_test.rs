use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::*;
use crate::bus::LocalBus;
use crate::protocol::{INVALID_ACTION, MISSING_TOKEN_OR_CONDITION, TOKEN_NOT_FOUND};
use crate::scene::test_helpers::{seeded_scene, token_at};
use crate::scene::{ItemFilter, ItemMutator, Layer, LocalPlayer, MemoryScene, SceneChange, Vector2};

struct Harness {
    scene: Arc<MemoryScene>,
    bus: Arc<LocalBus>,
    service: ActionService,
    token: SceneItem,
}

async fn harness() -> Harness {
    let token = token_at(100.0, 100.0);
    let scene = seeded_scene(vec![token.clone()]).await;
    let bus = Arc::new(LocalBus::new());
    let player = Arc::new(LocalPlayer::new("service-player"));
    let labels = LabelManager::new(scene.clone(), player);
    let service = ActionService::new(scene.clone(), bus.clone(), labels, MarkerConfig::default());
    Harness { scene, bus, service, token }
}

fn request(action: &str, token_id: &str, condition: &str, value: Option<&str>) -> serde_json::Value {
    let mut req = json!({
        "callId": "1700000000000-abc123",
        "requesterId": "caller-1",
        "action": action,
        "tokenId": token_id,
        "condition": condition,
    });
    if let Some(v) = value {
        req["value"] = json!(v);
    }
    req
}

impl Harness {
    async fn send(&self, action: &str, condition: &str, value: Option<&str>) -> ActionResponse {
        let payload = request(action, &self.token.id.to_string(), condition, value);
        self.service.handle_payload(payload).await.unwrap()
    }

    async fn markers(&self) -> Vec<SceneItem> {
        let token_id = self.token.id;
        self.scene
            .query(&|item: &SceneItem| item.is_marker_on(token_id))
            .await
            .unwrap()
    }

    async fn marker_for(&self, condition: &str) -> Option<SceneItem> {
        self.markers()
            .await
            .into_iter()
            .find(|m| m.marker().is_some_and(|meta| meta.condition == condition))
    }
}

// =============================================================================
// add
// =============================================================================

#[tokio::test]
async fn add_creates_marker_in_first_slot() {
    let h = harness().await;
    let resp = h.send("add", "Poisoned", None).await;

    assert!(resp.ok);
    assert_eq!(resp.added, Some(true));
    assert_eq!(resp.already_present, None);
    assert_eq!(resp.call_id, "1700000000000-abc123");
    assert_eq!(resp.requester_id, "caller-1");
    assert_eq!(resp.token_id, Some(h.token.id.to_string()));
    assert_eq!(resp.condition.as_deref(), Some("Poisoned"));

    let marker = h.marker_for("Poisoned").await.unwrap();
    assert_eq!(marker.marker().map(|m| m.slot), Some(0));
    assert!(marker.position.approx_eq(Vector2::new(-12.5, 25.0), 1e-9));
}

#[tokio::test]
async fn add_twice_is_already_present() {
    let h = harness().await;
    h.send("add", "Poisoned", None).await;

    let mut rx = h.scene.subscribe();
    let resp = h.send("add", "Poisoned", None).await;
    assert!(resp.ok);
    assert_eq!(resp.already_present, Some(true));
    assert_eq!(resp.added, None);
    assert_eq!(h.markers().await.len(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn second_condition_takes_next_slot() {
    let h = harness().await;
    h.send("add", "Poisoned", None).await;
    h.send("add", "Burned", None).await;

    let burned = h.marker_for("Burned").await.unwrap();
    assert_eq!(burned.marker().map(|m| m.slot), Some(1));
    assert!(burned.position.approx_eq(Vector2::new(-12.5, 62.5), 1e-9));
}

#[tokio::test]
async fn add_with_value_creates_label() {
    let h = harness().await;
    h.send("add", "Poisoned", Some("3")).await;

    let marker = h.marker_for("Poisoned").await.unwrap();
    let items = h.scene.snapshot().await;
    let label = items
        .iter()
        .find(|i| i.label().is_some() && i.attached_to == Some(marker.id))
        .unwrap();
    assert_eq!(label.text().map(|t| t.plain_text.as_str()), Some("3"));
}

#[tokio::test]
async fn add_with_empty_value_creates_no_label() {
    let h = harness().await;
    h.send("add", "Poisoned", Some("")).await;
    let items = h.scene.snapshot().await;
    assert!(items.iter().all(|i| i.label().is_none()));
}

// =============================================================================
// remove
// =============================================================================

#[tokio::test]
async fn remove_deletes_marker_and_label() {
    let h = harness().await;
    h.send("add", "Poisoned", Some("3")).await;

    let resp = h.send("remove", "Poisoned", None).await;
    assert!(resp.ok);
    assert_eq!(resp.deleted, Some(1));

    let items = h.scene.snapshot().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, h.token.id);
}

#[tokio::test]
async fn remove_absent_condition_deletes_nothing() {
    let h = harness().await;
    let resp = h.send("remove", "Poisoned", None).await;
    assert!(resp.ok);
    assert_eq!(resp.deleted, Some(0));
}

#[tokio::test]
async fn remove_clears_duplicates() {
    let h = harness().await;
    let dpi = h.scene.grid_dpi().await.unwrap();
    let a = layout::build_marker("Poisoned", &h.token, 0, dpi, "http://assets.test").unwrap();
    let b = layout::build_marker("Poisoned", &h.token, 0, dpi, "http://assets.test").unwrap();
    h.scene.seed(vec![a, b]).await;

    let resp = h.send("remove", "Poisoned", None).await;
    assert_eq!(resp.deleted, Some(2));
    assert!(h.markers().await.is_empty());
}

#[tokio::test]
async fn add_then_remove_restores_scene() {
    let h = harness().await;
    let before = h.scene.snapshot().await;

    h.send("add", "Poisoned", None).await;
    h.send("remove", "Poisoned", None).await;

    assert_eq!(h.scene.snapshot().await, before);
}

#[tokio::test]
async fn removing_first_condition_moves_second_up() {
    let h = harness().await;
    h.send("add", "Poisoned", None).await;
    h.send("add", "Burned", None).await;
    h.send("remove", "Poisoned", None).await;

    let markers = h.markers().await;
    assert_eq!(markers.len(), 1);
    let burned = &markers[0];
    assert_eq!(burned.marker().map(|m| m.condition.as_str()), Some("Burned"));
    assert_eq!(burned.marker().map(|m| m.slot), Some(0));
    assert!(burned.position.approx_eq(Vector2::new(-12.5, 25.0), 1e-9));
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn unknown_action_is_rejected() {
    let h = harness().await;
    let resp = h.send("toggle", "Poisoned", None).await;
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some(INVALID_ACTION));
}

#[tokio::test]
async fn missing_condition_is_rejected() {
    let h = harness().await;
    let payload = json!({ "callId": "c1", "requesterId": "r1", "action": "add", "tokenId": h.token.id.to_string() });
    let resp = h.service.handle_payload(payload).await.unwrap();
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some(MISSING_TOKEN_OR_CONDITION));
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let h = harness().await;
    for token_id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
        let resp = h
            .service
            .handle_payload(request("add", &token_id, "Poisoned", None))
            .await
            .unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.error.as_deref(), Some(TOKEN_NOT_FOUND));
        assert_eq!(resp.token_id, Some(token_id));
    }
    assert!(h.markers().await.is_empty());
}

#[tokio::test]
async fn text_item_is_not_a_token() {
    let h = harness().await;
    let m = layout::build_marker("Poisoned", &h.token, 0, 150.0, "http://assets.test").unwrap();
    let label = crate::services::label::build_label(&m, "Poisoned", "1");
    let label_id = label.id.to_string();
    h.scene.seed(vec![m, label]).await;

    let resp = h
        .service
        .handle_payload(request("add", &label_id, "Burned", None))
        .await
        .unwrap();
    assert_eq!(resp.error.as_deref(), Some(TOKEN_NOT_FOUND));
}

#[tokio::test]
async fn prop_image_is_not_a_token() {
    let h = harness().await;
    let mut prop = token_at(300.0, 100.0);
    prop.layer = Layer::Prop;
    let prop_id = prop.id;
    h.scene.seed(vec![prop]).await;

    let resp = h
        .service
        .handle_payload(request("add", &prop_id.to_string(), "Poisoned", None))
        .await
        .unwrap();
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some(TOKEN_NOT_FOUND));

    let markers = h
        .scene
        .query(&|item: &SceneItem| item.attached_to == Some(prop_id))
        .await
        .unwrap();
    assert!(markers.is_empty());
}

#[tokio::test]
async fn unaddressable_requests_are_dropped() {
    let h = harness().await;
    let no_call_id = json!({ "requesterId": "r1", "action": "add", "tokenId": h.token.id.to_string(), "condition": "Poisoned" });
    let empty_requester = json!({ "callId": "c1", "requesterId": "", "action": "add" });
    assert!(h.service.handle_payload(no_call_id).await.is_none());
    assert!(h.service.handle_payload(empty_requester).await.is_none());
    assert!(h.service.handle_payload(json!(42)).await.is_none());
    assert!(h.markers().await.is_empty());
}

// =============================================================================
// Store failures
// =============================================================================

struct OfflineStore {
    changes: broadcast::Sender<SceneChange>,
}

#[async_trait]
impl SceneStore for OfflineStore {
    async fn query(&self, _filter: ItemFilter<'_>) -> Result<Vec<SceneItem>, StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }

    async fn add(&self, _items: Vec<SceneItem>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }

    async fn update(&self, _ids: &[ItemId], _mutator: ItemMutator<'_>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }

    async fn delete(&self, _ids: &[ItemId]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SceneChange> {
        self.changes.subscribe()
    }

    async fn grid_dpi(&self) -> Result<f64, StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }
}

#[tokio::test]
async fn store_failure_becomes_failed_response() {
    let store: Arc<dyn SceneStore> = Arc::new(OfflineStore { changes: broadcast::channel(4).0 });
    let player = Arc::new(LocalPlayer::new("p1"));
    let labels = LabelManager::new(store.clone(), player);
    let service = ActionService::new(store, Arc::new(LocalBus::new()), labels, MarkerConfig::default());

    let resp = service
        .handle_payload(request("add", &Uuid::new_v4().to_string(), "Poisoned", None))
        .await
        .unwrap();
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some("scene store unavailable: offline"));
}

// =============================================================================
// Listener
// =============================================================================

#[tokio::test]
async fn listener_answers_on_response_channel() {
    let mut h = harness().await;
    h.service.start().unwrap();
    assert!(h.service.is_running());

    let config = MarkerConfig::default();
    let mut responses = h.bus.subscribe(&config.response_channel).unwrap();

    // Unaddressable request first: it must not kill the listener.
    h.bus
        .send(&config.request_channel, json!({ "action": "add" }))
        .await
        .unwrap();
    h.bus
        .send(&config.request_channel, request("add", &h.token.id.to_string(), "Poisoned", None))
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(1), responses.recv())
        .await
        .unwrap()
        .unwrap();
    let resp: ActionResponse = serde_json::from_value(payload).unwrap();
    assert!(resp.ok);
    assert_eq!(resp.added, Some(true));
    assert_eq!(h.markers().await.len(), 1);

    h.service.stop();
    assert!(!h.service.is_running());
}
