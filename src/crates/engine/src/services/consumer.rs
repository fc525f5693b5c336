//! Start-event consumer
//!
//! Turns "start" messages into dispatches. Delivery is at-least-once, so a
//! redelivered start for a task that already left `waiting` is acknowledged
//! without doing anything.

use crate::events::{EventBroker, EventHandler, Message, SubscribeOptions, Subscription, TaskEvent};
use crate::executor::RetryAttempt;
use crate::services::AsyncTaskService;
use crate::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct StartEventConsumer {
    service: Arc<AsyncTaskService>,
    shutdown: CancellationToken,
}

impl StartEventConsumer {
    /// Cancelling `shutdown` cancels every dispatch this consumer started.
    pub fn new(service: Arc<AsyncTaskService>, shutdown: CancellationToken) -> Self {
        Self { service, shutdown }
    }

    /// Subscribe to the service's start topic.
    pub async fn subscribe(
        self,
        broker: &dyn EventBroker,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let topic = self.service.topics().start.clone();
        info!(topic = %topic, concurrency = options.concurrency, "Starting start-event consumer");
        broker.subscribe(&topic, Arc::new(self), options).await
    }
}

#[async_trait]
impl EventHandler for StartEventConsumer {
    async fn handle(&self, message: &Message, attempt: RetryAttempt) -> Result<()> {
        let task_id = match TaskEvent::from_payload(&message.payload) {
            Ok(TaskEvent::Start { task_id, .. }) => task_id,
            Ok(other) => {
                debug!(event = other.name(), "Ignoring non-start event on start topic");
                return Ok(());
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Discarding undecodable start event");
                return Ok(());
            }
        };

        match self
            .service
            .dispatch(task_id, None, self.shutdown.child_token())
            .await
        {
            Ok(task) => {
                debug!(task_id, status = %task.status, "Dispatch complete");
                Ok(())
            }
            Err(EngineError::AlreadyDispatched(_)) => {
                debug!(task_id, "Duplicate start event, task already dispatched");
                Ok(())
            }
            // The task has been finalized as error; a redelivery would only
            // see AlreadyDispatched.
            Err(
                e @ (EngineError::EndpointUnavailable(_)
                | EngineError::Transport(_)
                | EngineError::Validation(_)
                | EngineError::Cancelled),
            ) => {
                warn!(task_id, error = %e, "Dispatch failed before streaming");
                Ok(())
            }
            Err(EngineError::TaskNotFound(_)) if attempt.is_last => {
                warn!(task_id, "Start event for unknown task, giving up");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
