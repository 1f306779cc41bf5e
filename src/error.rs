use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("A job with id \"{0}\" already exists")]
    DuplicateId(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Config key not found: {0}")]
    ConfigKeyNotFound(String),

    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
