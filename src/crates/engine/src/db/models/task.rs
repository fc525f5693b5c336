//! Task row model for database persistence

use crate::db::error::{DatabaseError, DbResult};
use crate::{Task, TaskStatus};
use bigmodel_providers::{GenerationParams, TaskType};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// A row of `bigmodel_tasks`.
///
/// # Timestamps
/// Timestamps are RFC 3339 strings due to SQLite type limitations.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub user_name: String,
    pub task_type: String,
    pub status: String,
    /// JSON object, see [`TaskMetadata`]
    pub metadata: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn status(&self) -> DbResult<TaskStatus> {
        self.status.parse().map_err(DatabaseError::decode)
    }

    /// Convert to the domain type.
    pub fn into_task(self) -> DbResult<Task> {
        let status = self.status()?;
        let task_type: TaskType = self.task_type.parse().map_err(DatabaseError::decode)?;
        let metadata = TaskMetadata::parse(&self.metadata);

        Ok(Task {
            id: self.id,
            user: self.user_name,
            task_type,
            status,
            style: metadata.style(),
            desc: metadata.desc(),
            params: metadata.params(),
            links: metadata.links(),
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::decode(format!("invalid timestamp {:?}: {}", raw, e)))
}

const STYLE: &str = "style";
const DESC: &str = "desc";
const PARAMS: &str = "params";
const LINKS: &str = "links";

/// Open-ended per-task attributes stored as one JSON object.
///
/// Readers take the keys they know and ignore the rest; writers keep keys
/// they do not touch, so rows written by newer code survive a round trip
/// through older code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMetadata {
    fields: Map<String, Value>,
}

impl TaskMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stored object. Anything that is not a JSON object reads as empty.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(fields)) => Self { fields },
            Ok(_) | Err(_) => {
                tracing::warn!(raw, "Ignoring malformed task metadata");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    pub fn style(&self) -> String {
        self.str_field(STYLE)
    }

    pub fn desc(&self) -> String {
        self.str_field(DESC)
    }

    pub fn params(&self) -> GenerationParams {
        self.fields
            .get(PARAMS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn links(&self) -> BTreeMap<String, String> {
        self.fields
            .get(LINKS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_style(&mut self, style: &str) {
        self.fields.insert(STYLE.to_string(), Value::from(style));
    }

    pub fn set_desc(&mut self, desc: &str) {
        self.fields.insert(DESC.to_string(), Value::from(desc));
    }

    pub fn set_params(&mut self, params: &GenerationParams) -> DbResult<()> {
        let value = serde_json::to_value(params)
            .map_err(|e| DatabaseError::decode(format!("params: {}", e)))?;
        self.fields.insert(PARAMS.to_string(), value);
        Ok(())
    }

    pub fn set_links(&mut self, links: &BTreeMap<String, String>) {
        let object = links
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        self.fields.insert(LINKS.to_string(), Value::Object(object));
    }

    fn str_field(&self, key: &str) -> String {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}
