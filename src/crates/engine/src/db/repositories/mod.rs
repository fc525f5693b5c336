//! Repository implementations for database access

pub mod task_repo;

pub use task_repo::SqliteTaskStore;
