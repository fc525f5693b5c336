//! Pub/sub seam

use crate::executor::{RetryAttempt, RetryConfig};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A published message as delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            headers,
            published_at: Utc::now(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Consumer of one topic.
///
/// Delivery is at-least-once, so `handle` must be idempotent. An `Err` is
/// retried per the subscription's [`RetryConfig`]; `attempt.is_last` lets
/// the handler settle for a degraded success instead.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &Message, attempt: RetryAttempt) -> Result<()>;
}

/// How a subscription runs its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub retry: RetryConfig,
    /// Messages handled at the same time
    pub concurrency: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            concurrency: 8,
        }
    }
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription>;
}

/// Handle on a running subscription.
///
/// Dropping it leaves the subscription running; call [`Subscription::shutdown`]
/// to stop it.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            cancel,
            handle,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop taking new messages and wait for in-flight handlers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(topic = %self.topic, error = %e, "Subscription task ended abnormally");
        }
    }
}
