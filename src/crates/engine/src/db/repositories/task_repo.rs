//! SQLite-backed task store

use crate::db::connection::DatabasePool;
use crate::db::error::DatabaseError;
use crate::db::models::{TaskMetadata, TaskRow};
use crate::store::{NewTask, TaskStore};
use crate::{EngineError, Result, Task, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;

/// Task store over the `bigmodel_tasks` table.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: DatabasePool,
}

impl SqliteTaskStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_row(&self, id: i64) -> Result<TaskRow> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM bigmodel_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?
            .ok_or(EngineError::TaskNotFound(id))
    }

    fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
        rows.into_iter()
            .map(|row| row.into_task().map_err(EngineError::from))
            .collect()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: NewTask) -> Result<Task> {
        let mut metadata = TaskMetadata::new();
        metadata.set_style(&task.style);
        metadata.set_desc(&task.desc);
        metadata.set_params(&task.params)?;

        let now = Utc::now().to_rfc3339();
        let row = sqlx::query_as::<_, TaskRow>(
            "INSERT INTO bigmodel_tasks (user_name, task_type, status, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&task.user)
        .bind(task.task_type.as_str())
        .bind(TaskStatus::Waiting.as_str())
        .bind(metadata.to_json())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        tracing::debug!(
            task_id = row.id,
            user = %task.user,
            task_type = %task.task_type,
            "Task created"
        );
        Ok(row.into_task()?)
    }

    async fn get_by_id(&self, id: i64) -> Result<Task> {
        Ok(self.fetch_row(id).await?.into_task()?)
    }

    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        links: Option<BTreeMap<String, String>>,
        error_message: Option<String>,
    ) -> Result<Task> {
        let current = self.fetch_row(id).await?;
        let from = current.status()?;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidStateTransition { from, to: status });
        }

        let mut metadata = TaskMetadata::parse(&current.metadata);
        if status == TaskStatus::Finished {
            if let Some(links) = &links {
                metadata.set_links(links);
            }
        }
        let error_message = if status == TaskStatus::Error {
            error_message
        } else {
            None
        };

        // Conditional on the status read above; a concurrent transition
        // makes this match zero rows.
        let updated = sqlx::query_as::<_, TaskRow>(
            "UPDATE bigmodel_tasks
             SET status = ?, metadata = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status = ?
             RETURNING *",
        )
        .bind(status.as_str())
        .bind(metadata.to_json())
        .bind(&error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        match updated {
            Some(row) => {
                tracing::debug!(task_id = id, from = %from, to = %status, "Task status updated");
                Ok(row.into_task()?)
            }
            None => {
                let now = self.fetch_row(id).await?.status()?;
                Err(EngineError::InvalidStateTransition { from: now, to: status })
            }
        }
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM bigmodel_tasks WHERE status = ? ORDER BY id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Self::into_tasks(rows)
    }

    async fn list_by_user(&self, user: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM bigmodel_tasks WHERE user_name = ? ORDER BY id DESC",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Self::into_tasks(rows)
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bigmodel_tasks WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(DatabaseError::from)?;

        Ok(count)
    }
}
