//! In-process broker over tokio channels.

use super::broker::{EventBroker, EventHandler, Message, SubscribeOptions, Subscription};
use crate::executor::retry_with_backoff;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

const DEFAULT_HISTORY: usize = 1024;
const DEFAULT_DEAD_LETTERS: usize = 256;

/// A message whose handler failed on every attempt.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Message,
    pub error: String,
}

/// Keeps the newest `limit` entries.
struct Bounded<T> {
    entries: Mutex<VecDeque<T>>,
    limit: usize,
}

impl<T: Clone> Bounded<T> {
    fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    fn push(&self, entry: T) {
        if self.limit == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Fan-out broker for a single process.
///
/// Each subscription gets every message published to its topic after it
/// subscribed. Messages on a topic with no subscribers are only kept in the
/// bounded history.
pub struct InMemoryBroker {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    history: Bounded<Message>,
    dead_letters: Arc<Bounded<DeadLetter>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY)
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            history: Bounded::new(limit),
            dead_letters: Arc::new(Bounded::new(DEFAULT_DEAD_LETTERS)),
        }
    }

    /// Keep at most `limit` dead letters, dropping the oldest first.
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letters = Arc::new(Bounded::new(limit));
        self
    }

    /// Recently published messages on `topic`, oldest first.
    pub fn history(&self, topic: &str) -> Vec<Message> {
        self.history
            .snapshot()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Most recent dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    fn record(&self, message: &Message) {
        self.history.push(message.clone());
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let message = Message::new(topic, payload, headers);
        self.record(&message);

        let delivered = match self.subscribers.get_mut(topic) {
            Some(mut senders) => {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                senders.len()
            }
            None => 0,
        };

        debug!(topic, message_id = %message.id, subscribers = delivered, "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic.to_string()).or_default().push(tx);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_subscription(
            topic.to_string(),
            rx,
            handler,
            options,
            self.dead_letters.clone(),
            cancel.clone(),
        ));

        debug!(topic, "Subscribed");
        Ok(Subscription::new(topic, cancel, handle))
    }
}

async fn run_subscription(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Message>,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    dead_letters: Arc<Bounded<DeadLetter>>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let tracker = TaskTracker::new();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = handler.clone();
        let retry = options.retry.clone();
        let dead_letters = dead_letters.clone();
        tracker.spawn(async move {
            let _permit = permit;
            let result = retry_with_backoff(&retry, "handle_event", |attempt| {
                handler.handle(&message, attempt)
            })
            .await;

            if let Err(e) = result {
                error!(
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "Handler failed on every attempt, dead-lettering message"
                );
                dead_letters.push(DeadLetter {
                    message,
                    error: e.to_string(),
                });
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    debug!(topic = %topic, "Subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RetryAttempt, RetryConfig};
    use crate::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl EventHandler for Collecting {
        async fn handle(&self, message: &Message, _attempt: RetryAttempt) -> Result<()> {
            self.seen.lock().push(message.payload.clone());
            Ok(())
        }
    }

    struct FailingFirst {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl EventHandler for FailingFirst {
        async fn handle(&self, _message: &Message, _attempt: RetryAttempt) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(EngineError::Broker("downstream unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_retry(attempts: u32) -> SubscribeOptions {
        SubscribeOptions {
            retry: RetryConfig::fixed(Duration::from_millis(1), attempts),
            concurrency: 1,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        let a = Arc::new(Collecting::default());
        let b = Arc::new(Collecting::default());
        let sub_a = broker.subscribe("t", a.clone(), fast_retry(1)).await.unwrap();
        let sub_b = broker.subscribe("t", b.clone(), fast_retry(1)).await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 2);

        broker.publish("t", b"one".to_vec(), HashMap::new()).await.unwrap();
        broker.publish("other", b"two".to_vec(), HashMap::new()).await.unwrap();
        settle().await;

        assert_eq!(*a.seen.lock(), vec![b"one".to_vec()]);
        assert_eq!(*b.seen.lock(), vec![b"one".to_vec()]);
        assert_eq!(broker.history("other").len(), 1);

        sub_a.shutdown().await;
        sub_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_retried_until_success() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FailingFirst {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let sub = broker.subscribe("t", handler.clone(), fast_retry(5)).await.unwrap();

        broker.publish("t", Vec::new(), HashMap::new()).await.unwrap();
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(broker.dead_letters().is_empty());
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_handler_dead_letters() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FailingFirst {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let sub = broker.subscribe("t", handler.clone(), fast_retry(3)).await.unwrap();

        broker.publish("t", b"payload".to_vec(), HashMap::new()).await.unwrap();
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.payload, b"payload".to_vec());
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_letters_are_bounded() {
        let broker = InMemoryBroker::new().with_dead_letter_limit(2);
        let handler = Arc::new(FailingFirst {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let sub = broker.subscribe("t", handler, fast_retry(1)).await.unwrap();

        for i in 0..5u8 {
            broker.publish("t", vec![i], HashMap::new()).await.unwrap();
        }
        settle().await;

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 2);
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let broker = InMemoryBroker::with_history_limit(2);
        for i in 0..5u8 {
            broker.publish("t", vec![i], HashMap::new()).await.unwrap();
        }
        let history = broker.history("t");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].payload, vec![4]);
    }

    #[tokio::test]
    async fn test_shutdown_drops_sender_on_next_publish() {
        let broker = InMemoryBroker::new();
        let sub = broker
            .subscribe("t", Arc::new(Collecting::default()), fast_retry(1))
            .await
            .unwrap();
        sub.shutdown().await;

        broker.publish("t", Vec::new(), HashMap::new()).await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 0);
    }
}
