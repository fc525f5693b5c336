//! Lifecycle event payloads and topics

use crate::executor::Completion;
use crate::{Result, Task};
use bigmodel_providers::TaskType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Header carrying the task id on every lifecycle message.
pub const TASK_ID_HEADER: &str = "task_id";
/// Header carrying the event name.
pub const EVENT_HEADER: &str = "event";

/// Broker topic per lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub start: String,
    pub running: String,
    pub finish: String,
    pub error: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            start: "bigmodel.task.start".to_string(),
            running: "bigmodel.task.running".to_string(),
            finish: "bigmodel.task.finish".to_string(),
            error: "bigmodel.task.error".to_string(),
        }
    }
}

/// Task lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Task persisted and waiting for dispatch
    #[serde(rename = "task.start")]
    Start {
        task_id: i64,
        user: String,
        task_type: TaskType,
        timestamp: String,
    },

    /// Task handed to the relay
    #[serde(rename = "task.running")]
    Running {
        task_id: i64,
        pool: String,
        timestamp: String,
    },

    /// Relay completed
    #[serde(rename = "task.finish")]
    Finish {
        task_id: i64,
        tokens: usize,
        links: BTreeMap<String, String>,
        timestamp: String,
    },

    /// Task ended in error
    #[serde(rename = "task.error")]
    Error {
        task_id: i64,
        error: String,
        timestamp: String,
    },
}

impl TaskEvent {
    pub fn start(task: &Task) -> Self {
        TaskEvent::Start {
            task_id: task.id,
            user: task.user.clone(),
            task_type: task.task_type,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn running(task_id: i64, pool: &str) -> Self {
        TaskEvent::Running {
            task_id,
            pool: pool.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn finish(task_id: i64, completion: &Completion) -> Self {
        TaskEvent::Finish {
            task_id,
            tokens: completion.tokens,
            links: completion.links.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(task_id: i64, error: impl Into<String>) -> Self {
        TaskEvent::Error {
            task_id,
            error: error.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn task_id(&self) -> i64 {
        match self {
            TaskEvent::Start { task_id, .. }
            | TaskEvent::Running { task_id, .. }
            | TaskEvent::Finish { task_id, .. }
            | TaskEvent::Error { task_id, .. } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Start { .. } => "task.start",
            TaskEvent::Running { .. } => "task.running",
            TaskEvent::Finish { .. } => "task.finish",
            TaskEvent::Error { .. } => "task.error",
        }
    }

    pub fn topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        match self {
            TaskEvent::Start { .. } => &topics.start,
            TaskEvent::Running { .. } => &topics.running,
            TaskEvent::Finish { .. } => &topics.finish,
            TaskEvent::Error { .. } => &topics.error,
        }
    }

    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (TASK_ID_HEADER.to_string(), self.task_id().to_string()),
            (EVENT_HEADER.to_string(), self.name().to_string()),
        ])
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
