use thiserror::Error;
use uuid::Uuid;

use store::StoreError;

use crate::worker::WorkerState;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("worker record corrupted: {0}")]
    Corrupted(String),

    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("safety check failed: {0}")]
    SafetyViolation(String),

    #[error("action request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
