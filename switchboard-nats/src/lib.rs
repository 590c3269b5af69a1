//! NATS-backed pub/sub bridge for `switchboard` (companion crate).
//!
//! Bring your own `async_nats::Client`; each user id maps to one subject
//! under a configurable prefix. Publishing is best effort: a lost
//! message falls back to the offline mailbox on the receiving side only
//! if a gateway is subscribed, so publish failures are logged loudly.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use switchboard::pubsub::{DeliveryHandler, PubSub, PubSubError};
use tokio::task::JoinHandle;

/// Default subject prefix; user 1001 becomes `chat.user.1001`.
pub const DEFAULT_SUBJECT_PREFIX: &str = "chat.user";

pub struct NatsPubSub {
    client: async_nats::Client,
    prefix: String,
    handler: Mutex<Option<DeliveryHandler>>,
    subscriptions: tokio::sync::Mutex<HashMap<i32, JoinHandle<()>>>,
}

impl std::fmt::Debug for NatsPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsPubSub").field("prefix", &self.prefix).finish()
    }
}

impl NatsPubSub {
    /// Bridge over an existing NATS connection with the default prefix.
    pub fn new(client: async_nats::Client) -> Self {
        Self::with_prefix(client, DEFAULT_SUBJECT_PREFIX)
    }

    pub fn with_prefix(client: async_nats::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            handler: Mutex::new(None),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn subject(&self, user_id: i32) -> String {
        format!("{}.{}", self.prefix, user_id)
    }
}

#[async_trait]
impl PubSub for NatsPubSub {
    async fn subscribe(&self, user_id: i32) -> Result<(), PubSubError> {
        let handler = self
            .handler
            .lock()
            .expect("pubsub lock")
            .clone()
            .ok_or_else(|| PubSubError::Connection("no delivery handler installed".into()))?;

        let subject = self.subject(user_id);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;

        let pump = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let payload = String::from_utf8_lossy(&message.payload).into_owned();
                handler(user_id, payload).await;
            }
        });

        let mut subs = self.subscriptions.lock().await;
        if let Some(stale) = subs.insert(user_id, pump) {
            stale.abort();
        }
        tracing::info!(user_id, subject, "nats subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, user_id: i32) -> Result<(), PubSubError> {
        if let Some(pump) = self.subscriptions.lock().await.remove(&user_id) {
            pump.abort();
            tracing::info!(user_id, "nats unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, user_id: i32, payload: &str) -> Result<(), PubSubError> {
        let subject = self.subject(user_id);
        self.client
            .publish(subject.clone(), payload.as_bytes().to_vec().into())
            .await
            .map_err(|e| {
                tracing::error!(subject, error = %e, "nats publish failed");
                PubSubError::Publish { channel: subject, reason: e.to_string() }
            })
    }

    fn set_delivery_handler(&self, handler: DeliveryHandler) {
        *self.handler.lock().expect("pubsub lock") = Some(handler);
    }
}
