//! Task persistence seam.

use crate::{Result, Task, TaskStatus};
use async_trait::async_trait;
use bigmodel_providers::{GenerationParams, TaskType};
use std::collections::BTreeMap;

/// Everything needed to persist a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub user: String,
    pub task_type: TaskType,
    pub style: String,
    pub desc: String,
    pub params: GenerationParams,
}

/// Durable record of tasks and their status.
///
/// `update_status` is atomic with respect to the transition check: of two
/// racing updates out of the same status, exactly one succeeds and the other
/// sees [`EngineError::InvalidStateTransition`](crate::EngineError).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a task in `waiting` and return it with its assigned id.
    async fn create(&self, task: NewTask) -> Result<Task>;

    /// Fails with `TaskNotFound` for unknown ids.
    async fn get_by_id(&self, id: i64) -> Result<Task>;

    /// Move a task to `status`.
    ///
    /// `links` is stored only when entering `finished`; `error_message` only
    /// when entering `error`.
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        links: Option<BTreeMap<String, String>>,
        error_message: Option<String>,
    ) -> Result<Task>;

    /// Tasks in `status`, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Tasks created by `user`, newest first.
    async fn list_by_user(&self, user: &str) -> Result<Vec<Task>>;

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64>;
}
