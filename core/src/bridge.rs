//! The channel-bridge seam. Concrete bridges (Telegram, Slack, a console)
//! handle protocol framing, media downloads, and markup conversion -- all
//! out of scope here -- and are represented to the rest of the core only by
//! this trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("channel '{0}' has no registered bridge")]
    UnknownChannel(String),
    #[error("send failed after retry budget exhausted: {0}")]
    SendFailed(#[from] anyhow::Error),
}

/// The only thing the Dispatcher needs from a channel implementation: a way
/// to push text back out to a channel_id. Retries with backoff on transient
/// network failure are the bridge's own concern.
#[async_trait]
pub trait ChannelBridge: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), BridgeError>;
}

/// Dispatches to whichever bridge owns a given channel_id, keyed by a
/// platform tag carried on each [`Message`](crate::queue::Message).
#[derive(Default, Clone)]
pub struct BridgeRegistry {
    bridges: Arc<DashMap<String, Arc<dyn ChannelBridge>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, platform: impl Into<String>, bridge: Arc<dyn ChannelBridge>) {
        self.bridges.insert(platform.into(), bridge);
    }

    pub async fn send(&self, platform: &str, channel_id: &str, text: &str) -> Result<(), BridgeError> {
        let bridge = self
            .bridges
            .get(platform)
            .map(|b| b.clone())
            .ok_or_else(|| BridgeError::UnknownChannel(platform.to_string()))?;
        bridge.send(channel_id, text).await
    }
}

/// In-memory fake used by tests and by the console entry point: records
/// every send and echoes it to stdout. Grounded on the teacher's
/// `InMemoryTransport`, the in-process stand-in for a real transport.
pub struct InMemoryBridge {
    sent: parking_lot::Mutex<Vec<(String, String)>>,
}

impl Default for InMemoryBridge {
    fn default() -> Self {
        Self { sent: parking_lot::Mutex::new(Vec::new()) }
    }
}

impl InMemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChannelBridge for InMemoryBridge {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), BridgeError> {
        self.sent.lock().push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_routes_by_platform() {
        let registry = BridgeRegistry::new();
        let bridge = Arc::new(InMemoryBridge::new());
        registry.register("console", bridge.clone());

        registry.send("console", "c1", "hello").await.unwrap();
        assert_eq!(bridge.sent(), vec![("c1".to_string(), "hello".to_string())]);

        let err = registry.send("telegram", "c2", "hi").await;
        assert!(matches!(err, Err(BridgeError::UnknownChannel(_))));
    }
}
