//! Task services

pub mod consumer;
pub mod task;

pub use consumer::StartEventConsumer;
pub use task::{AsyncTaskService, CreateTaskRequest};
