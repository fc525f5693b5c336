#![allow(dead_code)]

use async_trait::async_trait;
use bigmodel_engine::db::{DatabaseConnection, SqliteTaskStore};
use bigmodel_engine::executor::{Moderation, ModerationError};
use bigmodel_providers::{ByteStream, ProviderError, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What the fake upstream does for one `open` call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Send each line as its own read, then close.
    Lines(Vec<String>),
    /// Send the lines, then fail the read.
    LinesThenError(Vec<String>),
    /// Send the lines, then never produce anything else.
    LinesThenHang(Vec<String>),
    /// Fail before any response.
    OpenError(u16),
}

/// Transport that replays scripts in order; the last script repeats.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Transport for tests that never reach the upstream.
    pub fn idle() -> Arc<Self> {
        Self::new(Vec::<Script>::new())
    }

    /// Endpoints opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    fn next_script(&self) -> Script {
        let mut scripts = self.scripts.lock();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap()
        } else {
            scripts.front().cloned().unwrap_or(Script::Lines(Vec::new()))
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        endpoint: &str,
        _body: &serde_json::Value,
    ) -> bigmodel_providers::Result<ByteStream> {
        self.opened.lock().push(endpoint.to_string());

        let reads = |lines: Vec<String>| {
            lines
                .into_iter()
                .map(|l| Ok::<_, ProviderError>(format!("{}\n", l).into_bytes()))
                .collect::<Vec<_>>()
        };

        let stream: ByteStream = match self.next_script() {
            Script::Lines(lines) => Box::pin(futures::stream::iter(reads(lines))),
            Script::LinesThenError(lines) => {
                let mut items = reads(lines);
                items.push(Err(ProviderError::Stream("connection reset".to_string())));
                Box::pin(futures::stream::iter(items))
            }
            Script::LinesThenHang(lines) => {
                use futures::StreamExt;
                Box::pin(futures::stream::iter(reads(lines)).chain(futures::stream::pending()))
            }
            Script::OpenError(status) => {
                return Err(ProviderError::Status {
                    status,
                    body: "upstream unavailable".to_string(),
                })
            }
        };
        Ok(stream)
    }
}

/// One GLM-style line.
pub fn glm_line(reply: &str, finished: bool) -> String {
    serde_json::json!({"reply": reply, "status": 200, "finished": finished}).to_string()
}

/// `count` GLM tokens `t0`, `t1`, ... with the last one finished.
pub fn glm_tokens(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| glm_line(&format!("t{}", i), i + 1 == count))
        .collect()
}

/// Counts checks and blocks once the checked text contains `needle`.
#[derive(Default)]
pub struct CountingModeration {
    needle: Option<String>,
    checks: AtomicUsize,
    unavailable: bool,
}

impl CountingModeration {
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn blocking(needle: &str) -> Arc<Self> {
        Arc::new(Self {
            needle: Some(needle.to_string()),
            ..Default::default()
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Default::default()
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Moderation for CountingModeration {
    async fn check(&self, text: &str) -> Result<(), ModerationError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ModerationError::CheckFailed("moderation service down".to_string()));
        }
        match &self.needle {
            Some(needle) if text.contains(needle.as_str()) => {
                Err(ModerationError::Blocked(format!("contains {}", needle)))
            }
            _ => Ok(()),
        }
    }
}

pub async fn memory_store() -> (DatabaseConnection, Arc<SqliteTaskStore>) {
    let db = DatabaseConnection::open(":memory:")
        .await
        .expect("Failed to open test database");
    let store = Arc::new(SqliteTaskStore::new(db.pool().clone()));
    (db, store)
}
