use thiserror::Error;

/// Store-level error, tagged by category so callers can decide whether to
/// retry, surface to the operator, or treat a job as permanently failed.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient database error: {0}")]
    Transient(#[from] sqlx::Error),

    #[error("orphan recovery failed: {0}")]
    Orphan(String),

    #[error("operational error: {0}")]
    Operational(String),
}

pub type StoreResult<T> = Result<T, JobStoreError>;
