use std::time::Duration;

use thiserror::Error;

use crate::{
    device::{ContextId, DeviceError},
    sync::region::SlotKey,
    trace::op::OpId,
};

/// Backtrace captured where an invariant broke. Prints nothing unless
/// capturing is enabled through `RUST_BACKTRACE`.
#[derive(Debug)]
pub struct InvariantTrace(std::backtrace::Backtrace);

impl InvariantTrace {
    #[inline(always)]
    fn capture() -> Self {
        Self(std::backtrace::Backtrace::capture())
    }

    pub fn backtrace(&self) -> &std::backtrace::Backtrace {
        &self.0
    }
}

impl std::fmt::Display for InvariantTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status() {
            std::backtrace::BacktraceStatus::Captured => write!(f, "{}", self.0),
            _ => Ok(()),
        }
    }
}

/// Caller contract breaches. These are never produced by a device or by a
/// slow condition, only by misuse of the engine.
#[derive(Error, Debug)]
pub enum InvariantError {
    #[error("Operation #{0} is not part of the graph")]
    UnknownOperation(OpId),
    #[error("Operation #{op} can not depend on #{dep} which was never issued")]
    UnknownDependency { op: OpId, dep: OpId },
    #[error("Operation #{0} can not depend on itself")]
    SelfDependency(OpId),
    #[error("Operation id {id} must be greater than the last issued id {last}")]
    IdOutOfOrder { id: OpId, last: OpId },
    #[error("Semaphore slot {0} has not been acquired")]
    UnknownSlot(SlotKey),
    #[error("Region handle for {0} is stale; the slot was reallocated")]
    StaleRegion(SlotKey),
    #[error("Checkpoint {checkpoint}: participant {context} added after commands were injected")]
    ParticipantAfterSeal {
        checkpoint: String,
        context: ContextId,
    },
    #[error("Checkpoint {checkpoint}: context {context} is already a participant")]
    DuplicateParticipant {
        checkpoint: String,
        context: ContextId,
    },
    #[error("Checkpoint {checkpoint}: context {context} is not a participant")]
    UnknownParticipant {
        checkpoint: String,
        context: ContextId,
    },
    #[error("Checkpoint {checkpoint}: context {context} disagrees on its role (claims coordinator: {claims_coordinator})")]
    RoleMismatch {
        checkpoint: String,
        context: ContextId,
        claims_coordinator: bool,
    },
    #[error("Checkpoint {checkpoint}: context expects {expected} participants but the group has {actual}")]
    ParticipantCountMismatch {
        checkpoint: String,
        expected: usize,
        actual: usize,
    },
    #[error("None of the {remaining} outstanding operations can make progress")]
    Deadlock { remaining: usize },
    #[error("Checkpoint {checkpoint}: release step {step} is unusable with {workers} workers")]
    InvalidStep {
        checkpoint: String,
        step: u32,
        workers: usize,
    },
    #[error("Checkpoint {checkpoint} has no coordinator")]
    MissingCoordinator { checkpoint: String },
    #[error("Checkpoint {checkpoint}: context {context} can not {action} while {phase}")]
    PhaseViolation {
        checkpoint: String,
        context: ContextId,
        action: &'static str,
        phase: &'static str,
    },
}

impl InvariantError {
    #[inline(always)]
    pub fn into_error(self) -> ReplayError {
        ReplayError::Invariant {
            source: self,
            backtrace: InvariantTrace::capture(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("{source}\n{backtrace}")]
    Invariant {
        source: InvariantError,
        backtrace: InvariantTrace,
    },

    #[error("Timed out on #{op} waiting for {condition} after {}s", .timeout.as_secs_f32())]
    Timeout {
        op: OpId,
        condition: String,
        timeout: Duration,
    },

    #[error("Timed out after {}s with {remaining} operations outstanding", .timeout.as_secs_f32())]
    GlobalTimeout { timeout: Duration, remaining: usize },

    #[error("Failed to {action} semaphore region")]
    Resource {
        action: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Checkpoint {checkpoint} was aborted")]
    Aborted { checkpoint: String },
}

impl From<InvariantError> for ReplayError {
    fn from(value: InvariantError) -> Self {
        value.into_error()
    }
}

impl ReplayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplayError::Invariant { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ReplayError::Timeout { .. } | ReplayError::GlobalTimeout { .. }
        )
    }

    pub fn invariant(&self) -> Option<&InvariantError> {
        if let ReplayError::Invariant { source, .. } = self {
            Some(source)
        } else {
            None
        }
    }
}

pub type Result<T, E = ReplayError> = std::result::Result<T, E>;
