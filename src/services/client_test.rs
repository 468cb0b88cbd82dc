use std::time::Duration;

use serde_json::json;

use super::*;
use crate::bus::LocalBus;
use crate::scene::LocalPlayer;

fn short_timeout() -> MarkerConfig {
    MarkerConfig { request_timeout_ms: 50, ..MarkerConfig::default() }
}

/// Answer every request with `added`, addressed to `answer_as` when set
/// and to the real requester otherwise.
fn spawn_responder(bus: Arc<LocalBus>, config: &MarkerConfig, answer_as: Option<&str>) -> JoinHandle<()> {
    let mut requests = bus.subscribe(&config.request_channel).unwrap();
    let response_channel = config.response_channel.clone();
    let answer_as = answer_as.map(str::to_string);
    tokio::spawn(async move {
        while let Ok(payload) = requests.recv().await {
            let req: RawRequest = serde_json::from_value(payload).unwrap();
            let mut ctx = req.context().unwrap();
            if let Some(other) = &answer_as {
                ctx.requester_id.clone_from(other);
            }
            let resp = ActionResponse::to(&req, &ctx).added();
            bus.send(&response_channel, serde_json::to_value(&resp).unwrap())
                .await
                .unwrap();
        }
    })
}

async fn client(bus: &Arc<LocalBus>, config: MarkerConfig) -> ActionClient {
    let player = LocalPlayer::new("player-1");
    ActionClient::start(bus.clone(), &player, config).await.unwrap()
}

#[tokio::test]
async fn requester_id_is_player_id() {
    let bus = Arc::new(LocalBus::new());
    let client = client(&bus, MarkerConfig::default()).await;
    assert_eq!(client.requester_id(), "player-1");
}

#[tokio::test]
async fn call_resolves_with_matching_response() {
    let bus = Arc::new(LocalBus::new());
    let config = MarkerConfig::default();
    let responder = spawn_responder(bus.clone(), &config, None);
    let client = client(&bus, config).await;

    let resp = client.add_condition("token-1", "Poisoned", Some("2")).await.unwrap();
    assert!(resp.ok);
    assert_eq!(resp.added, Some(true));
    assert_eq!(resp.requester_id, "player-1");
    assert_eq!(resp.token_id.as_deref(), Some("token-1"));
    assert_eq!(client.pending_count(), 0);
    responder.abort();
}

#[tokio::test]
async fn request_carries_action_and_value() {
    let bus = Arc::new(LocalBus::new());
    let config = short_timeout();
    let mut requests = bus.subscribe(&config.request_channel).unwrap();
    let client = client(&bus, config).await;

    // Nobody answers; we only inspect what went out.
    let result = client.remove_condition("token-1", "Burned").await;
    assert!(result.is_err());

    let payload = requests.recv().await.unwrap();
    assert_eq!(payload["action"], "remove");
    assert_eq!(payload["tokenId"], "token-1");
    assert_eq!(payload["condition"], "Burned");
    assert_eq!(payload["requesterId"], "player-1");
    assert!(payload.get("value").is_none());
}

#[tokio::test]
async fn timeout_reports_api_timeout_and_cleans_up() {
    let bus = Arc::new(LocalBus::new());
    let client = client(&bus, short_timeout()).await;

    let err = client.add_condition("token-1", "Poisoned", None).await.unwrap_err();
    assert_eq!(err.error_code(), crate::protocol::API_TIMEOUT);
    assert!(err.retryable());
    assert!(matches!(err, ClientError::Action(ActionError::Timeout { timeout_ms: 50, .. })));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn responses_for_other_requesters_are_ignored() {
    let bus = Arc::new(LocalBus::new());
    let config = short_timeout();
    let responder = spawn_responder(bus.clone(), &config, Some("someone-else"));
    let client = client(&bus, config).await;

    let err = client.add_condition("token-1", "Poisoned", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Action(ActionError::Timeout { .. })));
    assert_eq!(client.pending_count(), 0);
    responder.abort();
}

#[tokio::test]
async fn abandoned_call_removes_its_waiter() {
    let bus = Arc::new(LocalBus::new());
    let client = client(&bus, MarkerConfig::default()).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(20), client.add_condition("token-1", "Poisoned", None)).await;
    assert!(abandoned.is_err());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let bus = Arc::new(LocalBus::new());
    let config = MarkerConfig::default();
    let responder = spawn_responder(bus.clone(), &config, None);
    let client = client(&bus, config).await;

    let (a, b) = tokio::join!(
        client.add_condition("token-1", "Poisoned", None),
        client.add_condition("token-2", "Burned", None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.call_id, b.call_id);
    assert_eq!(a.condition.as_deref(), Some("Poisoned"));
    assert_eq!(b.condition.as_deref(), Some("Burned"));
    responder.abort();
}

// =============================================================================
// route_response
// =============================================================================

#[test]
fn route_response_delivers_only_exact_matches() {
    let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
    let (tx, mut rx) = oneshot::channel();
    pending.lock().unwrap().insert("c1".to_string(), tx);

    // Right call id, wrong requester.
    route_response(&pending, "me", json!({ "callId": "c1", "requesterId": "you", "ok": true }));
    assert_eq!(pending.lock().unwrap().len(), 1);

    // Garbage is ignored.
    route_response(&pending, "me", json!("not a response"));
    assert_eq!(pending.lock().unwrap().len(), 1);

    route_response(&pending, "me", json!({ "callId": "c1", "requesterId": "me", "ok": true, "deleted": 0 }));
    assert!(pending.lock().unwrap().is_empty());
    let resp = rx.try_recv().unwrap();
    assert_eq!(resp.deleted, Some(0));
}

#[test]
fn late_duplicate_response_is_dropped() {
    let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
    route_response(&pending, "me", json!({ "callId": "c1", "requesterId": "me", "ok": true }));
    assert!(pending.lock().unwrap().is_empty());
}
