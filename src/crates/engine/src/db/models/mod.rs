//! Row models

pub mod task;

pub use task::{TaskMetadata, TaskRow};
