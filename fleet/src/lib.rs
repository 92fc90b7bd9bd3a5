pub mod audit;
pub mod controller;
pub mod error;
pub mod registry;
pub mod safety;
pub mod signals;
pub mod worker;

pub use controller::{ActionRequest, ActionResponse, ActionStatus, FleetController};
pub use error::FleetError;
pub use registry::{WorkerRegistry, WorkerRegistryConfig};
pub use worker::{Worker, WorkerState};
