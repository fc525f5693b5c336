//! Wiring from [`EngineConfig`] to a running service.

use crate::config::{ConfigError, EngineConfig};
use crate::db::{DatabaseConnection, SqliteTaskStore};
use crate::events::{EventBroker, InMemoryBroker, Subscription};
use crate::executor::{AllowAll, KeywordModeration, Moderation, StreamingRelay};
use crate::services::{AsyncTaskService, StartEventConsumer};
use crate::{EngineError, Result};
use bigmodel_providers::image::TextToImageAdapter;
use bigmodel_providers::{AdapterRegistry, HttpTransport, Transport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// One fully wired engine: store, broker, service and start consumer.
pub struct Engine {
    service: Arc<AsyncTaskService>,
    broker: Arc<InMemoryBroker>,
    database: DatabaseConnection,
    shutdown: CancellationToken,
    consumer: Option<Subscription>,
}

impl Engine {
    /// Build with the HTTP transport and start consuming start events.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.transport.clone())?;
        Self::start_with_transport(config, Arc::new(transport)).await
    }

    /// Same as [`start`](Self::start) over a caller-supplied transport.
    pub async fn start_with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let database = DatabaseConnection::open(&config.database.path).await?;
        let store = Arc::new(SqliteTaskStore::new(database.pool().clone()));
        let broker = Arc::new(InMemoryBroker::new());

        let moderation: Arc<dyn Moderation> = if config.moderation.blocked_words.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(KeywordModeration::new(&config.moderation.blocked_words))
        };
        let adapters = AdapterRegistry::with_defaults()
            .register(TextToImageAdapter::new().with_styles(config.image.styles.iter().cloned()));

        let relay = StreamingRelay::new(transport, config.relay_config());
        let mut service = AsyncTaskService::new(store, broker.clone(), relay)
            .with_adapters(adapters)
            .with_moderation(moderation)
            .with_topics(config.topics.clone())
            .with_buffer_size(config.relay.buffer_size);
        for (task_type, router) in config.routers()? {
            info!(
                task_type = %task_type,
                pools = router.pools().count(),
                endpoints = router.pools().map(|p| p.capacity()).sum::<usize>(),
                "Configured endpoint pools"
            );
            service = service.with_router(task_type, router);
        }
        let service = Arc::new(service);

        let shutdown = CancellationToken::new();
        let consumer = StartEventConsumer::new(service.clone(), shutdown.clone())
            .subscribe(broker.as_ref() as &dyn EventBroker, config.consumer.subscribe_options())
            .await?;

        info!(database = %config.database.path, "Engine started");
        Ok(Self {
            service,
            broker,
            database,
            shutdown,
            consumer: Some(consumer),
        })
    }

    pub fn service(&self) -> &Arc<AsyncTaskService> {
        &self.service
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn database(&self) -> &DatabaseConnection {
        &self.database
    }

    /// Cancel in-flight dispatches, wait for the consumer, close the database.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(consumer) = self.consumer.take() {
            consumer.shutdown().await;
        }
        self.database.close().await;
        info!("Engine stopped");
    }
}
