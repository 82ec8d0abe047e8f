pub use config::EngineOptions;
pub use error::{InvariantError, ReplayError, Result};
pub use sync::{CheckpointGroup, CheckpointKind, HostRendezvous, Participant, SemaphorePool};
pub use trace::{Driver, OpKind, Operation, OperationGraph, TriggerPoint};

pub mod config;
pub mod device;
pub mod error;
pub mod sync;
pub mod trace;
