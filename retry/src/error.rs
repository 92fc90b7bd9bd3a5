use thiserror::Error;

use store::StoreError;

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate policy: {0}")]
    DuplicatePolicy(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("insufficient training data: need {needed}, have {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("supervised predictor is disabled")]
    MlDisabled,

    #[error("model deploy failed: {0}")]
    DeployFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
