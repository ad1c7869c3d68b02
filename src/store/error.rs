#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),
}

pub type StoreResult<T> = Result<T, StoreError>;
