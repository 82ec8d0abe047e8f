pub use driver::{DriveEnv, DriveReport, Driver};
pub use graph::OperationGraph;
pub use op::{Compare, OpId, OpKind, OpStatus, Operation, Progress, Step, TriggerPoint};

pub mod driver;
pub mod graph;
pub mod op;
pub mod poll;
