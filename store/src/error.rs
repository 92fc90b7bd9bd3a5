use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The key exists but holds a different structure (string vs hash vs
    /// zset vs list).
    #[error("wrong type for key: {0}")]
    WrongType(String),

    /// Infrastructure failure (connection, IO, SQL). Decision engines treat
    /// this as a degraded-mode marker, never as a business error.
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
