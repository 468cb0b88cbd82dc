//! Broadcast bus — named point-to-multipoint channels.
//!
//! DESIGN
//! ======
//! Every subscriber of a channel sees every payload sent on it after it
//! subscribed, including the sender's own. Delivery is best-effort and
//! at-least-once from the protocol's point of view: a payload may reach
//! several services, and responses may be lost.
//!
//! `LocalBus` is the in-process implementation: one tokio broadcast
//! sender per channel name, created on first use.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broadcast channel poisoned: {0}")]
    Poisoned(String),
    #[error("broadcast payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl crate::protocol::ErrorCode for BusError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Poisoned(_) => "E_BUS_POISONED",
            Self::Encode(_) => "E_BUS_ENCODE",
        }
    }
}

/// Message bus shared by every client in the scene.
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Send `payload` to every current subscriber of `channel`.
    async fn send(&self, channel: &str, payload: serde_json::Value) -> Result<(), BusError>;

    /// Subscribe to `channel`. Only payloads sent after this call arrive.
    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<serde_json::Value>, BusError>;
}

#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> Result<broadcast::Sender<serde_json::Value>, BusError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|e| BusError::Poisoned(e.to_string()))?;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.clone())
    }
}

#[async_trait]
impl Broadcast for LocalBus {
    async fn send(&self, channel: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let tx = self.sender(channel)?;
        match tx.send(payload) {
            Ok(receivers) => debug!(channel, receivers, "bus: sent"),
            Err(_) => debug!(channel, "bus: sent with no subscribers"),
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<serde_json::Value>, BusError> {
        Ok(self.sender(channel)?.subscribe())
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;
