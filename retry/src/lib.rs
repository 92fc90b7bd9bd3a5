pub mod bayesian;
pub mod counters;
pub mod engine;
pub mod error;
pub mod history;
pub mod policy;
pub mod supervised;
pub mod types;

pub use engine::{RetryEngine, RetryEngineConfig};
pub use error::RetryError;
pub use types::{AttemptRecord, DecisionMethod, Guardrails, RetryFeatures, RetryRecommendation};
