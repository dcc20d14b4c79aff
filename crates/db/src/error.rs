//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(sqlx::Error),

    /// The requested row does not exist (or a guarded update touched nothing).
    #[error("row not found")]
    NotFound,

    /// A uniqueness constraint rejected the write, e.g. a second step for
    /// the same node of a task.
    #[error("conflicting row: {0}")]
    Conflict(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DbError::Conflict(db_err.message().to_owned())
            }
            _ => DbError::Sqlx(err),
        }
    }
}
