//! Asynchronous task service
//!
//! Owns the create -> dispatch -> relay -> finalize flow and announces every
//! status change on the event broker.

use crate::events::{EventBroker, TaskEvent, TopicConfig};
use crate::executor::{
    AllowAll, Completion, EndpointPool, FailureReason, Moderation, PoolRouter, PoolStats,
    StreamBuilder, StreamEvent, StreamingRelay,
};
use crate::store::{NewTask, TaskStore};
use crate::{EngineError, Result, Task, TaskStatus};
use bigmodel_providers::{
    AdapterRegistry, GenerationParams, GenerationRequest, ProviderAdapter, ProviderError, TaskType,
};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Request to create a task
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTaskRequest {
    pub user: String,
    pub task_type: TaskType,
    pub style: String,
    pub desc: String,
    pub params: GenerationParams,
}

impl CreateTaskRequest {
    pub fn new(user: impl Into<String>, task_type: TaskType, desc: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            task_type,
            style: String::new(),
            desc: desc.into(),
            params: GenerationParams::default(),
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    fn generation_request(&self) -> GenerationRequest {
        GenerationRequest::new(self.task_type, self.desc.clone())
            .with_style(self.style.clone())
            .with_params(self.params.clone())
    }
}

/// Task service
pub struct AsyncTaskService {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn EventBroker>,
    relay: StreamingRelay,
    adapters: AdapterRegistry,
    routers: HashMap<TaskType, PoolRouter>,
    moderation: Arc<dyn Moderation>,
    topics: TopicConfig,
    buffer_size: usize,
    in_flight: DashMap<i64, CancellationToken>,
    observers: DashMap<i64, mpsc::Sender<StreamEvent>>,
}

impl AsyncTaskService {
    /// Service with the default adapters, no moderation and no pools.
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn EventBroker>,
        relay: StreamingRelay,
    ) -> Self {
        Self {
            store,
            broker,
            relay,
            adapters: AdapterRegistry::with_defaults(),
            routers: HashMap::new(),
            moderation: Arc::new(AllowAll),
            topics: TopicConfig::default(),
            buffer_size: 64,
            in_flight: DashMap::new(),
            observers: DashMap::new(),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Endpoints serving `task_type`.
    pub fn with_router(mut self, task_type: TaskType, router: PoolRouter) -> Self {
        self.routers.insert(task_type, router);
        self
    }

    pub fn with_moderation(mut self, moderation: Arc<dyn Moderation>) -> Self {
        self.moderation = moderation;
        self
    }

    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    /// Events buffered between a relay worker and its dispatcher.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Validate, persist in `waiting`, and announce the task.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        self.create(request, None).await
    }

    /// Like [`create_task`](Self::create_task), but the dispatch that picks
    /// the task up streams its events to `observer`.
    pub async fn create_task_with_observer(
        &self,
        request: CreateTaskRequest,
        observer: mpsc::Sender<StreamEvent>,
    ) -> Result<Task> {
        self.create(request, Some(observer)).await
    }

    async fn create(
        &self,
        request: CreateTaskRequest,
        observer: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<Task> {
        self.validate(&request)?;

        let task = self
            .store
            .create(NewTask {
                user: request.user.trim().to_string(),
                task_type: request.task_type,
                style: request.style,
                desc: request.desc,
                params: request.params,
            })
            .await?;
        tracing::info!("Created task: {} ({})", task.id, task.task_type);

        if let Some(observer) = observer {
            self.observers.insert(task.id, observer);
        }

        if let Err(e) = self.publish(&TaskEvent::start(&task)).await {
            tracing::error!("Failed to announce task {}: {}", task.id, e);
            self.observers.remove(&task.id);
            self.finalize_error(task.id, &format!("failed to announce task: {}", e))
                .await?;
            return Err(e);
        }

        Ok(task)
    }

    fn validate(&self, request: &CreateTaskRequest) -> Result<()> {
        if request.user.trim().is_empty() {
            return Err(EngineError::Validation("user is required".to_string()));
        }
        let adapter = self.adapter(request.task_type)?;
        self.router(request.task_type)?;

        adapter
            .validate(&request.generation_request())
            .map_err(|e| match e {
                ProviderError::InvalidRequest(msg) => EngineError::Validation(msg),
                other => EngineError::Transport(other),
            })
    }

    fn adapter(&self, task_type: TaskType) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(task_type)
            .ok_or_else(|| EngineError::Validation(format!("unsupported task type: {}", task_type)))
    }

    fn router(&self, task_type: TaskType) -> Result<&PoolRouter> {
        self.routers.get(&task_type).ok_or_else(|| {
            EngineError::Validation(format!("no endpoints configured for {}", task_type))
        })
    }

    /// Run a waiting task to completion.
    ///
    /// Returns the task in its terminal status. `Err` means the task never
    /// reached the upstream stream (it is marked `error` where possible), or
    /// that it had already left `waiting`, reported as `AlreadyDispatched`.
    /// Events go to `observer`, or to the observer registered at creation.
    /// A registered observer is released whichever way dispatch ends.
    pub async fn dispatch(
        &self,
        task_id: i64,
        observer: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> Result<Task> {
        // Claimed on every path so a registered sender never outlives its dispatch.
        let registered = self.observers.remove(&task_id).map(|(_, tx)| tx);
        let observer = observer.or(registered);

        let task = self.store.get_by_id(task_id).await?;
        if task.status != TaskStatus::Waiting {
            return Err(EngineError::AlreadyDispatched(task_id));
        }

        let resolved = self
            .adapter(task.task_type)
            .and_then(|adapter| Ok((adapter, self.router(task.task_type)?)));
        let (adapter, router) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.finalize_error(task_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let request = task.generation_request();
        let pool = router.select(request.input_len()).clone();

        match self
            .store
            .update_status(task_id, TaskStatus::Running, None, None)
            .await
        {
            Ok(_) => {}
            Err(EngineError::InvalidStateTransition { .. }) => {
                return Err(EngineError::AlreadyDispatched(task_id));
            }
            Err(e) => return Err(e),
        }
        tracing::info!("Dispatching task {} to pool {}", task_id, pool.name());
        self.announce(&TaskEvent::running(task_id, pool.name())).await;

        self.in_flight.insert(task_id, cancel.clone());
        let result = self
            .relay_task(task_id, &pool, adapter, &request, observer, cancel)
            .await;
        self.in_flight.remove(&task_id);
        result
    }

    async fn relay_task(
        &self,
        task_id: i64,
        pool: &EndpointPool,
        adapter: Arc<dyn ProviderAdapter>,
        request: &GenerationRequest,
        mut observer: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> Result<Task> {
        let (emitter, mut stream) = StreamBuilder::new().buffer_size(self.buffer_size).build();

        if let Err(e) = self
            .relay
            .execute(pool, adapter, request, self.moderation.clone(), emitter, cancel.clone())
            .await
        {
            tracing::warn!("Task {} could not start: {}", task_id, e);
            self.finalize_error(task_id, &e.to_string()).await?;
            return Err(e);
        }

        let mut terminal = StreamEvent::Failure(FailureReason::Interrupted);
        while let Some(event) = stream.next().await {
            let observer_gone = match &observer {
                Some(tx) => tx.send(event.clone()).await.is_err(),
                None => false,
            };
            if observer_gone {
                tracing::debug!("Observer for task {} went away, cancelling", task_id);
                observer = None;
                cancel.cancel();
            }
            if event.is_terminal() {
                terminal = event;
                break;
            }
        }

        match terminal {
            StreamEvent::Done(completion) => self.finalize_done(task_id, completion).await,
            StreamEvent::Failure(reason) => self.finalize_error(task_id, &reason.to_string()).await,
            StreamEvent::Token(_) => {
                self.finalize_error(task_id, &FailureReason::Interrupted.to_string())
                    .await
            }
        }
    }

    async fn finalize_done(&self, task_id: i64, completion: Completion) -> Result<Task> {
        let task = self
            .store
            .update_status(
                task_id,
                TaskStatus::Finished,
                Some(completion.links.clone()),
                None,
            )
            .await?;
        tracing::info!("Task {} finished after {} tokens", task_id, completion.tokens);
        self.announce(&TaskEvent::finish(task_id, &completion)).await;
        Ok(task)
    }

    async fn finalize_error(&self, task_id: i64, message: &str) -> Result<Task> {
        let task = self
            .store
            .update_status(task_id, TaskStatus::Error, None, Some(message.to_string()))
            .await?;
        tracing::warn!("Task {} failed: {}", task_id, message);
        self.announce(&TaskEvent::error(task_id, message)).await;
        Ok(task)
    }

    /// Cancel an in-flight dispatch. Returns `false` if the task is not running here.
    pub fn cancel(&self, task_id: i64) -> bool {
        match self.in_flight.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Tasks currently being relayed by this service.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.store.get_by_id(task_id).await
    }

    pub async fn list_tasks(&self, user: &str) -> Result<Vec<Task>> {
        self.store.list_by_user(user).await
    }

    /// Snapshot of every configured pool.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut task_types: Vec<_> = self.routers.keys().copied().collect();
        task_types.sort();
        task_types
            .into_iter()
            .flat_map(|t| self.routers[&t].pools().map(EndpointPool::stats).collect::<Vec<_>>())
            .collect()
    }

    async fn publish(&self, event: &TaskEvent) -> Result<()> {
        let payload = event.to_payload()?;
        self.broker
            .publish(event.topic(&self.topics), payload, event.headers())
            .await
    }

    /// Publish where the stored status is already authoritative.
    async fn announce(&self, event: &TaskEvent) {
        if let Err(e) = self.publish(event).await {
            tracing::warn!(
                "Failed to publish {} for task {}: {}",
                event.name(),
                event.task_id(),
                e
            );
        }
    }
}
