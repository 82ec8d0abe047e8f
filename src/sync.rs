pub use checkpoint::{CheckpointGroup, CheckpointKind, Participant, Role};
pub use host::HostSemaphore;
pub use region::{RegionHandle, SemaphorePool, SlotKey, SlotKind};
pub use rendezvous::{HostRendezvous, Rendezvous};

pub mod checkpoint;
pub mod host;
pub mod region;
pub mod rendezvous;
