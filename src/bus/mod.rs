//! Event bus client: JSON envelopes published and consumed on a named
//! subject space. The orchestrator only ever sees the [`EventPublisher`]
//! capability; the full client rides on the embedded broker core.

pub mod subjects;

use crate::broker::BrokerCore;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Millisecond timestamp carried by every published event.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The JSON envelope routed by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable message id; durable events are retry-safe under it.
    pub id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub timestamp_ms: i64,
    pub payload: serde_json::Value,
    /// Delivery attempt, 1-based; >1 only for durable redeliveries.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

const fn default_attempt() -> u32 {
    1
}

impl Message {
    pub fn new<T: Serialize>(subject: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            reply: None,
            timestamp_ms: now_ms(),
            payload: serde_json::to_value(payload)?,
            attempt: 1,
        })
    }

    /// Deserialize the payload into a typed event.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Handler registered for a subject pattern. Durable subjects treat a
/// returned error as a negative acknowledgment.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<()> {
        (self.0)(message.clone()).await
    }
}

/// The publish capability the orchestrator depends on. Never the broker
/// itself, so a no-op can be substituted when messaging is disabled.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_raw(&self, subject: &str, payload: serde_json::Value) -> Result<()>;
}

/// Serialize and publish a typed event through any publisher.
pub async fn publish_json<T: Serialize>(
    publisher: &dyn EventPublisher,
    subject: &str,
    event: &T,
) -> Result<()> {
    publisher
        .publish_raw(subject, serde_json::to_value(event)?)
        .await
}

/// Publisher that drops everything; used when the broker is disabled.
#[derive(Debug, Default, Clone)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish_raw(&self, subject: &str, _payload: serde_json::Value) -> Result<()> {
        debug!(subject, "event dropped (noop publisher)");
        Ok(())
    }
}

/// Client handle onto the broker core.
#[derive(Clone)]
pub struct BusClient {
    core: Arc<BrokerCore>,
    request_timeout: Duration,
}

impl BusClient {
    #[must_use]
    pub fn new(core: Arc<BrokerCore>, request_timeout: Duration) -> Self {
        Self {
            core,
            request_timeout,
        }
    }

    /// Standalone in-memory bus for tests and broker-less setups.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(BrokerCore::launch(None), Duration::from_secs(5))
    }

    /// Asynchronous publish. Fails with Messaging only when the local
    /// enqueue fails; broker-side failures surface via [`Self::publish_with_ack`].
    pub async fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        let message = Message::new(subject, payload)?;
        self.core.enqueue(message, None)
    }

    /// Publish and receive the broker-side delivery outcome.
    pub async fn publish_with_ack<T: Serialize>(
        &self,
        subject: &str,
        payload: &T,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let message = Message::new(subject, payload)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.core.enqueue(message, Some(ack_tx))?;
        Ok(ack_rx)
    }

    /// Register a handler for a subject pattern. A second subscription on
    /// the same subject composes in registration order.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<u64> {
        self.core.subscribe(pattern, None, handler).await
    }

    /// Register a handler in a named queue group; each message is
    /// delivered to exactly one member of the group.
    pub async fn queue_subscribe(
        &self,
        pattern: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<u64> {
        self.core
            .subscribe(pattern, Some(group.to_string()), handler)
            .await
    }

    pub async fn unsubscribe(&self, subscription_id: u64) {
        self.core.unsubscribe(subscription_id).await;
    }

    /// Round trip: publish with a reply inbox and await the first answer.
    pub async fn request<T: Serialize>(&self, subject: &str, payload: &T) -> Result<Message> {
        let inbox = format!("{}{}", subjects::INBOX_PREFIX, uuid::Uuid::new_v4().simple());
        let (reply_tx, reply_rx) = oneshot::channel::<Message>();
        let slot = Arc::new(Mutex::new(Some(reply_tx)));

        let handler = Arc::new(FnHandler(move |message: Message| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().await.take() {
                    let _ = tx.send(message);
                }
                Ok(())
            }
        }));
        let subscription_id = self.core.subscribe(&inbox, None, handler).await?;

        let mut message = Message::new(subject, payload)?;
        message.reply = Some(inbox);
        let enqueued = self.core.enqueue(message, None);

        let result = match enqueued {
            Ok(()) => match tokio::time::timeout(self.request_timeout, reply_rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(Error::Messaging("reply channel closed".to_string())),
                Err(_) => Err(Error::Timeout {
                    operation: format!("request on {subject}"),
                    timeout: self.request_timeout,
                }),
            },
            Err(error) => Err(error),
        };

        self.core.unsubscribe(subscription_id).await;
        result
    }

    /// Answer a message on its reply subject.
    pub async fn respond<T: Serialize>(&self, message: &Message, payload: &T) -> Result<()> {
        let reply = message
            .reply
            .as_deref()
            .ok_or_else(|| Error::Messaging("no reply subject".to_string()))?;
        self.publish(reply, payload).await
    }

    /// Messages persisted and not yet acknowledged on a durable subject.
    pub fn pending(&self, subject: &str) -> Result<usize> {
        self.core.pending_len(subject)
    }
}

#[async_trait]
impl EventPublisher for BusClient {
    async fn publish_raw(&self, subject: &str, payload: serde_json::Value) -> Result<()> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            reply: None,
            timestamp_ms: now_ms(),
            payload,
            attempt: 1,
        };
        self.core.enqueue(message, None)
    }
}
