use thiserror::Error;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid cron expression, or an expression with no further occurrence.
    #[error("cron error: {0}")]
    Cron(#[from] croner::errors::CronError),
}

pub type Result<T> = std::result::Result<T, Error>;
