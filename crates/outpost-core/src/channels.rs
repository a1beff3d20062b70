use crate::outpost_ipc::MessageEnvelope;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub fn new_channel_id() -> String {
    format!("conn-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no open connection for channel {0}")]
    UnknownChannel(String),
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("outbound queue full for connection {0}")]
    Backpressure(String),
}

/// Addressable outbound side of every open connection.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    async fn send(&self, channel_id: &str, envelope: MessageEnvelope) -> Result<(), DeliveryError>;
}

/// In-process channel layer: one bounded queue per open connection, drained
/// by that connection's writer task.
pub struct ChannelRegistry {
    capacity: usize,
    senders: RwLock<HashMap<String, mpsc::Sender<MessageEnvelope>>>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, channel_id: &str) -> mpsc::Receiver<MessageEnvelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.write().await.insert(channel_id.to_string(), tx);
        debug!(event = "channel_registered", conn_id = channel_id);
        rx
    }

    pub async fn unregister(&self, channel_id: &str) -> bool {
        let removed = self.senders.write().await.remove(channel_id).is_some();
        if removed {
            debug!(event = "channel_unregistered", conn_id = channel_id);
        }
        removed
    }

    pub async fn open_count(&self) -> usize {
        self.senders.read().await.len()
    }

    #[cfg(test)]
    async fn contains(&self, channel_id: &str) -> bool {
        self.senders.read().await.contains_key(channel_id)
    }
}

#[async_trait]
impl ChannelLayer for ChannelRegistry {
    async fn send(&self, channel_id: &str, envelope: MessageEnvelope) -> Result<(), DeliveryError> {
        let sender = {
            let senders = self.senders.read().await;
            senders.get(channel_id).cloned()
        };
        let Some(sender) = sender else {
            return Err(DeliveryError::UnknownChannel(channel_id.to_string()));
        };

        match sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(channel_id).await;
                Err(DeliveryError::Closed(channel_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "channel_backpressure", conn_id = channel_id);
                Err(DeliveryError::Backpressure(channel_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_are_unique() {
        let a = new_channel_id();
        let b = new_channel_id();
        assert!(a.starts_with("conn-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn send_reaches_registered_receiver() {
        let registry = ChannelRegistry::new(4);
        let mut rx = registry.register("c1").await;

        registry
            .send("c1", MessageEnvelope::trigger_update())
            .await
            .expect("send");
        assert_eq!(rx.recv().await, Some(MessageEnvelope::trigger_update()));
    }

    #[tokio::test]
    async fn unknown_and_closed_channels_fail() {
        let registry = ChannelRegistry::new(4);
        assert_eq!(
            registry.send("missing", MessageEnvelope::ack()).await,
            Err(DeliveryError::UnknownChannel("missing".to_string()))
        );

        let rx = registry.register("c1").await;
        drop(rx);
        assert_eq!(
            registry.send("c1", MessageEnvelope::ack()).await,
            Err(DeliveryError::Closed("c1".to_string()))
        );
        assert!(!registry.contains("c1").await);
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure_and_keeps_channel() {
        let registry = ChannelRegistry::new(1);
        let _rx = registry.register("c1").await;

        registry.send("c1", MessageEnvelope::ack()).await.expect("first");
        assert_eq!(
            registry.send("c1", MessageEnvelope::ack()).await,
            Err(DeliveryError::Backpressure("c1".to_string()))
        );
        assert!(registry.contains("c1").await);
        assert_eq!(registry.open_count().await, 1);
    }
}
