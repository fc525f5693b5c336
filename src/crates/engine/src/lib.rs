//! BigModel asynchronous task engine.
//!
//! A task is created in `waiting`, announced on the event broker, and picked
//! up by a consumer that relays the upstream stream to the caller while
//! tracking status in the task store:
//!
//! ```text
//! create_task ──> store(waiting) ──> broker "start"
//!                                          │
//!                               StartEventConsumer
//!                                          │
//!            dispatch ──> store(running) ──> StreamingRelay ──> finished | error
//!                                                │
//!                                  EndpointPool lease + Moderation
//! ```
//!
//! # Modules
//!
//! - [`executor`] - endpoint pools, retry, streaming relay, moderation
//! - [`db`] - SQLite persistence and the [`store::TaskStore`] implementation
//! - [`events`] - lifecycle events and the in-process broker
//! - [`services`] - [`services::AsyncTaskService`] and the start consumer
//! - [`config`] - TOML configuration
//! - [`engine`] - wiring from configuration to a running service

pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod executor;
pub mod services;
pub mod store;

use bigmodel_providers::{GenerationParams, GenerationRequest, ProviderError, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use engine::Engine;
pub use executor::{
    Completion, EndpointLease, EndpointPool, FailureReason, Moderation, ModerationError,
    PoolRouter, RetryConfig, StreamEvent, StreamingRelay,
};
pub use services::{AsyncTaskService, CreateTaskRequest, StartEventConsumer};
pub use store::{NewTask, TaskStore};

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {0} has already been dispatched")]
    AlreadyDispatched(i64),

    #[error("No endpoint available: {0}")]
    EndpointUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] ProviderError),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),

    #[error("Event broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Lifecycle status of a task.
///
/// Legal moves are `waiting -> running`, `running -> finished`,
/// `running -> error` and `waiting -> error` (a task that could not be
/// handed to an endpoint). `finished` and `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Error,
}

impl TaskStatus {
    /// Stable lowercase name, also the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }

    /// Statuses a task may be in immediately before entering `self`.
    pub fn predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Waiting => &[],
            TaskStatus::Running => &[TaskStatus::Waiting],
            TaskStatus::Finished => &[TaskStatus::Running],
            TaskStatus::Error => &[TaskStatus::Waiting, TaskStatus::Running],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A unit of asynchronous work as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub style: String,
    pub desc: String,
    pub params: GenerationParams,
    /// Result links, present once the task has finished.
    pub links: BTreeMap<String, String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Upstream request this task describes.
    pub fn generation_request(&self) -> GenerationRequest {
        GenerationRequest::new(self.task_type, self.desc.clone())
            .with_style(self.style.clone())
            .with_params(self.params.clone())
    }
}
