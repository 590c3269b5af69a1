//! Cross-gateway pub/sub bridge.
//!
//! Channels are keyed by user id. A gateway subscribes a user's channel
//! at login and unsubscribes at logout/disconnect; a message published
//! to the channel reaches whichever gateway currently holds the user's
//! session and is forwarded or, if the user vanished meanwhile,
//! persisted to the offline mailbox by the delivery handler.
//!
//! [`MemoryPubSub`] connects gateways inside one process (tests,
//! single-node deployments); `switchboard-nats` maps the same contract
//! onto NATS subjects.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Invoked with `(user_id, payload)` for each message arriving on a
/// subscribed channel.
pub type DeliveryHandler = Arc<dyn Fn(i32, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("pubsub connection: {0}")]
    Connection(String),
    #[error("pubsub publish to `{channel}`: {reason}")]
    Publish { channel: String, reason: String },
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Route messages for `user_id` to this instance's delivery handler.
    async fn subscribe(&self, user_id: i32) -> Result<(), PubSubError>;
    async fn unsubscribe(&self, user_id: i32) -> Result<(), PubSubError>;
    async fn publish(&self, user_id: i32, payload: &str) -> Result<(), PubSubError>;
    /// Install the handler receiving subscribed messages.
    fn set_delivery_handler(&self, handler: DeliveryHandler);
}

/// Process-local message bus shared by [`MemoryPubSub`] endpoints.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<i32, Vec<(usize, DeliveryHandler)>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// One gateway's endpoint on a [`MemoryBus`].
pub struct MemoryPubSub {
    bus: Arc<MemoryBus>,
    endpoint_id: usize,
    handler: Mutex<Option<DeliveryHandler>>,
}

impl MemoryPubSub {
    pub fn attach(bus: Arc<MemoryBus>) -> Self {
        static NEXT_ENDPOINT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        Self {
            bus,
            endpoint_id: NEXT_ENDPOINT.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            handler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, user_id: i32) -> Result<(), PubSubError> {
        let handler = self
            .handler
            .lock()
            .expect("pubsub lock")
            .clone()
            .ok_or_else(|| PubSubError::Connection("no delivery handler installed".into()))?;
        let mut subs = self.bus.subscribers.lock().expect("bus lock");
        let entries = subs.entry(user_id).or_default();
        entries.retain(|(id, _)| *id != self.endpoint_id);
        entries.push((self.endpoint_id, handler));
        tracing::info!(user_id, "pubsub subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, user_id: i32) -> Result<(), PubSubError> {
        let mut subs = self.bus.subscribers.lock().expect("bus lock");
        if let Some(entries) = subs.get_mut(&user_id) {
            entries.retain(|(id, _)| *id != self.endpoint_id);
            if entries.is_empty() {
                subs.remove(&user_id);
            }
        }
        tracing::info!(user_id, "pubsub unsubscribed");
        Ok(())
    }

    async fn publish(&self, user_id: i32, payload: &str) -> Result<(), PubSubError> {
        let handlers: Vec<DeliveryHandler> = {
            let subs = self.bus.subscribers.lock().expect("bus lock");
            subs.get(&user_id)
                .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(user_id, payload.to_string()).await;
        }
        Ok(())
    }

    fn set_delivery_handler(&self, handler: DeliveryHandler) {
        *self.handler.lock().expect("pubsub lock") = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn recording_handler() -> (DeliveryHandler, Arc<AsyncMutex<Vec<(i32, String)>>>) {
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |user, payload| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push((user, payload));
            })
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn publish_reaches_the_subscribed_endpoint() {
        let bus = MemoryBus::new();
        let a = MemoryPubSub::attach(bus.clone());
        let b = MemoryPubSub::attach(bus.clone());

        let (handler, seen) = recording_handler();
        b.set_delivery_handler(handler);
        b.subscribe(42).await.unwrap();

        a.publish(42, r#"{"msgid":7}"#).await.unwrap();
        let seen = seen.lock().await;
        assert_eq!(seen.as_slice(), &[(42, r#"{"msgid":7}"#.to_string())]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let a = MemoryPubSub::attach(bus.clone());
        let b = MemoryPubSub::attach(bus.clone());

        let counter = Arc::new(AtomicUsize::new(0));
        let n = counter.clone();
        b.set_delivery_handler(Arc::new(move |_, _| {
            let n = n.clone();
            Box::pin(async move {
                n.fetch_add(1, Ordering::SeqCst);
            })
        }));
        b.subscribe(7).await.unwrap();
        a.publish(7, "x").await.unwrap();
        b.unsubscribe(7).await.unwrap();
        a.publish(7, "y").await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_without_handler_is_rejected() {
        let bus = MemoryBus::new();
        let a = MemoryPubSub::attach(bus);
        assert!(matches!(a.subscribe(1).await, Err(PubSubError::Connection(_))));
    }

    #[tokio::test]
    async fn publish_to_silent_channel_is_a_noop() {
        let bus = MemoryBus::new();
        let a = MemoryPubSub::attach(bus);
        a.publish(99, "nobody home").await.unwrap();
    }
}
