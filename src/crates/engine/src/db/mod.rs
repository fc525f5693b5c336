//! SQLite persistence for tasks
//!
//! Connection management, row models and the SQLite-backed
//! [`TaskStore`](crate::store::TaskStore).

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;

pub use connection::{DatabaseConnection, DatabasePool};
pub use error::{DatabaseError, DbResult};
pub use repositories::SqliteTaskStore;
