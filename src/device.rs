use std::time::Duration;

pub use method::{Command, Method};

pub mod method;
pub mod sim;

/// Identity of one execution context's submission stream.
pub type ContextId = u32;

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VasHandle(pub u64);

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemHandle(pub u64);

impl std::fmt::Display for VasHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vas{:x}", self.0)
    }
}

impl std::fmt::Display for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem{:x}", self.0)
    }
}

/// A virtual-only allocation inside one address space.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct VirtualMapping {
    pub vas: VasHandle,
    pub va: u64,
    pub size: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("Out of device memory allocating {0} bytes")]
    OutOfMemory(u64),
    #[error("Invalid memory handle {0}")]
    InvalidMemory(MemHandle),
    #[error("Invalid address space {0}")]
    InvalidAddressSpace(VasHandle),
    #[error("{mem} is not shared with context {context}")]
    NotShared { mem: MemHandle, context: u32 },
    #[error("No mapping at 0x{va:x} in {vas}")]
    Unmapped { vas: VasHandle, va: u64 },
    #[error("Offset 0x{offset:x} is outside of {mem}")]
    OutOfRange { mem: MemHandle, offset: u64 },
    #[error("Command 0x{method:x} was rejected: {reason}")]
    Rejected { method: u32, reason: String },
    #[error("Timed out while waiting {0:?} for the channel to idle")]
    IdleTimeout(Duration),
}

/// The in-order command stream owned by one execution context.
pub trait CommandQueue: Send {
    fn flush(&mut self) -> Result<(), DeviceError>;

    /// Blocks until every flushed command of this queue has retired.
    fn wait_for_local_idle(&mut self, timeout: Duration) -> Result<(), DeviceError>;

    /// Single non-blocking inspection of the same condition as `wait_for_local_idle`.
    fn is_idle(&mut self) -> Result<bool, DeviceError>;

    fn inject(&mut self, method: u32, data: &[u32]) -> Result<(), DeviceError>;

    fn vas(&self) -> VasHandle;

    fn submission_id(&self) -> ContextId;

    fn inject_command(&mut self, command: &Command) -> Result<(), DeviceError> {
        self.inject(command.method, &command.data)
    }
}

pub trait ExecutionContext: Send {
    fn queue(&mut self) -> &mut dyn CommandQueue;

    fn is_coordinator_for_group(&self) -> bool;

    fn participant_count(&self) -> usize;

    fn id(&mut self) -> ContextId {
        self.queue().submission_id()
    }

    fn vas(&mut self) -> VasHandle {
        self.queue().vas()
    }
}

/// Physical and virtual memory management shared by every context on a device.
pub trait DeviceMemory: Send + Sync {
    fn alloc_physical(&self, size: u64) -> Result<MemHandle, DeviceError>;

    fn free_physical(&self, mem: MemHandle) -> Result<(), DeviceError>;

    /// Share `mem` into the access scope of `context`. Sharing an already
    /// shared allocation succeeds without doing anything.
    fn duplicate(&self, mem: MemHandle, context: ContextId) -> Result<(), DeviceError>;

    fn alloc_virtual(&self, vas: VasHandle, size: u64) -> Result<VirtualMapping, DeviceError>;

    fn bind(&self, mapping: &VirtualMapping, mem: MemHandle, offset: u64)
        -> Result<(), DeviceError>;

    /// Releases the virtual allocation along with any binding it has.
    fn unmap(&self, mapping: &VirtualMapping) -> Result<(), DeviceError>;

    fn read32(&self, vas: VasHandle, va: u64) -> Result<u32, DeviceError>;

    fn write_physical32(&self, mem: MemHandle, offset: u64, value: u32)
        -> Result<(), DeviceError>;
}
