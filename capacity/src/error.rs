use thiserror::Error;

use store::StoreError;

#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no metric history available")]
    NoHistory,

    #[error("insufficient metric history: need {needed}, have {got}")]
    InsufficientHistory { needed: usize, got: usize },

    #[error("metrics unavailable for queue: {0}")]
    MetricsUnavailable(String),

    #[error("metrics feed failure: {0}")]
    Feed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
