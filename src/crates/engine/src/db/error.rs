//! Database error types

use thiserror::Error;

/// Failure talking to the task table.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The pool or the file behind it could not be reached
    #[error("Task store unavailable: {0}")]
    Unavailable(String),

    /// A CHECK constraint rejected the row
    #[error("Row rejected by schema: {0}")]
    Constraint(String),

    /// A stored row does not map back onto a task
    #[error("Malformed task row: {0}")]
    Decode(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl DatabaseError {
    pub fn decode(msg: impl Into<String>) -> Self {
        DatabaseError::Decode(msg.into())
    }
}

/// Result type for database operations
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { index, source } => {
                DatabaseError::Decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
                DatabaseError::Decode(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                DatabaseError::Constraint(db_err.message().to_string())
            }
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => DatabaseError::Unavailable(err.to_string()),
            sqlx::Error::Migrate(err) => DatabaseError::Migration(err.to_string()),
            err => DatabaseError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::Migration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_failures_map_to_unavailable() {
        for err in [sqlx::Error::PoolTimedOut, sqlx::Error::PoolClosed] {
            let db_err: DatabaseError = err.into();
            assert!(matches!(db_err, DatabaseError::Unavailable(_)));
        }
    }

    #[test]
    fn test_missing_column_is_a_decode_error() {
        let db_err: DatabaseError = sqlx::Error::ColumnNotFound("style".to_string()).into();
        assert!(matches!(db_err, DatabaseError::Decode(_)));
        assert!(db_err.to_string().contains("style"));
    }
}
