use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    device::{Command, DeviceMemory, MemHandle, VirtualMapping},
    error::{ReplayError, Result},
    sync::checkpoint::{CheckpointGroup, CheckpointKind},
};

use super::{driver::DriveEnv, poll};

pub type OpId = u32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    #[default]
    Default,
    Pending,
    Done,
}

/// When an operation fires relative to the surrounding test phase. The graph
/// only carries it; the caller picks which trigger point to drive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPoint {
    Parse,
    #[default]
    BeforeRun,
    AfterRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Compare {
    pub fn holds(&self, current: u32, expected: u32) -> bool {
        match self {
            Compare::Equal => current == expected,
            Compare::NotEqual => current != expected,
            Compare::Less => current < expected,
            Compare::LessOrEqual => current <= expected,
            Compare::Greater => current > expected,
            Compare::GreaterOrEqual => current >= expected,
        }
    }
}

impl std::fmt::Display for Compare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Compare::Equal => "==",
            Compare::NotEqual => "!=",
            Compare::Less => "<",
            Compare::LessOrEqual => "<=",
            Compare::Greater => ">",
            Compare::GreaterOrEqual => ">=",
        })
    }
}

/// Operation kinds that are not built in.
pub trait Step: Send {
    fn describe(&self) -> String;

    fn is_pollable(&self) -> bool {
        false
    }

    /// Called once per drive cycle until it returns `Done`. Anything that
    /// should only happen once must be remembered by the step itself.
    fn run(&mut self, env: &mut DriveEnv<'_>) -> Result<Progress>;
}

pub enum OpKind {
    Method(Command),
    Flush,
    WaitIdle,
    WaitValue {
        memory: MemHandle,
        offset: u64,
        compare: Compare,
        value: u32,
    },
    Delay(Duration),
    Checkpoint {
        kind: CheckpointKind,
        group: Arc<CheckpointGroup>,
    },
    Custom(Box<dyn Step>),
}

impl OpKind {
    pub fn is_pollable(&self) -> bool {
        match self {
            OpKind::WaitIdle | OpKind::WaitValue { .. } | OpKind::Delay(_) => true,
            OpKind::Method(_) | OpKind::Flush | OpKind::Checkpoint { .. } => false,
            OpKind::Custom(step) => step.is_pollable(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            OpKind::Method(command) => format!("method {command}"),
            OpKind::Flush => "flush".to_string(),
            OpKind::WaitIdle => "channel idle".to_string(),
            OpKind::WaitValue {
                memory,
                offset,
                compare,
                value,
            } => format!("{memory}+0x{offset:x} {compare} {value}"),
            OpKind::Delay(delay) => format!("delay {delay:?}"),
            OpKind::Checkpoint { kind, group } => format!("checkpoint {}:{kind}", group.name()),
            OpKind::Custom(step) => step.describe(),
        }
    }
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Mapping set up for polling a `WaitValue`. Returned to the device when the
/// wait ends or, failing that, when the operation is dropped.
struct PolledMapping {
    memory: Arc<dyn DeviceMemory>,
    mapping: Option<VirtualMapping>,
}

impl PolledMapping {
    fn current(&self) -> Option<VirtualMapping> {
        self.mapping
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mapping) = self.mapping.take() {
            self.memory.unmap(&mapping)?;
        }
        Ok(())
    }
}

impl Drop for PolledMapping {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("failed to return polling mapping: {err}");
        }
    }
}

impl std::fmt::Debug for PolledMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.mapping, f)
    }
}

#[derive(Debug, Default)]
struct PollState {
    mapping: Option<PolledMapping>,
    started: Option<Instant>,
    setups: u32,
}

#[derive(Debug)]
pub struct Operation {
    pub(crate) id: OpId,
    kind: OpKind,
    status: OpStatus,
    pub(crate) deps: VecDeque<OpId>,
    pub(crate) implicit_dep: bool,
    trigger: TriggerPoint,
    timeout: Option<Duration>,
    poll: PollState,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Self {
            id: 0,
            kind,
            status: OpStatus::Default,
            deps: VecDeque::new(),
            implicit_dep: false,
            trigger: TriggerPoint::default(),
            timeout: None,
            poll: PollState::default(),
        }
    }

    pub fn trigger(mut self, trigger: TriggerPoint) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: OpStatus) {
        self.status = status;
    }

    pub fn trigger_point(&self) -> TriggerPoint {
        self.trigger
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }

    /// Dependencies that have not been seen complete yet.
    pub fn dependencies(&self) -> impl Iterator<Item = OpId> + '_ {
        self.deps.iter().copied()
    }

    pub fn has_implicit_dependency(&self) -> bool {
        self.implicit_dep
    }

    pub fn is_pollable(&self) -> bool {
        self.kind.is_pollable()
    }

    pub fn describe(&self) -> String {
        self.kind.describe()
    }

    /// How many times one-time setup has run for this operation.
    pub fn setup_count(&self) -> u32 {
        self.poll.setups
    }

    /// One attempt at making progress. A failed attempt drops whatever the
    /// polling set up, so a retry starts over with a fresh timeout.
    pub(crate) fn advance(&mut self, env: &mut DriveEnv<'_>) -> Result<Progress> {
        let result = self.attempt(env);
        if result.is_err() {
            self.reset_polling();
        }
        result
    }

    fn reset_polling(&mut self) {
        self.poll.started = None;
        if let Some(mut polled) = self.poll.mapping.take() {
            if let Err(err) = polled.release() {
                tracing::warn!("#{}: failed to return polling mapping: {err}", self.id);
            }
        }
    }

    fn attempt(&mut self, env: &mut DriveEnv<'_>) -> Result<Progress> {
        let id = self.id;
        let timeout = env.options().effective_timeout(self.timeout);

        match &mut self.kind {
            OpKind::Method(command) => {
                env.queue().inject_command(command)?;
                Ok(Progress::Done)
            }
            OpKind::Flush => {
                env.queue().flush()?;
                Ok(Progress::Done)
            }
            OpKind::WaitIdle => {
                if env.blocking() {
                    poll::block_until_idle(id, env, timeout)
                } else {
                    let started = *self.poll.started.get_or_insert_with(Instant::now);
                    let idle = env.queue().is_idle()?;
                    poll::check(id, "channel idle", started, timeout, idle)
                }
            }
            OpKind::WaitValue {
                memory,
                offset,
                compare,
                value,
            } => {
                let (memory, offset, compare, value) = (*memory, *offset, *compare, *value);
                let mapping = match self.poll.mapping.as_ref().and_then(PolledMapping::current) {
                    Some(mapping) => mapping,
                    None => {
                        let mapping = map_for_polling(env, memory, offset)?;
                        self.poll.setups += 1;
                        self.poll.mapping = Some(PolledMapping {
                            memory: env.shared_memory(),
                            mapping: Some(mapping),
                        });
                        mapping
                    }
                };

                let condition = format!("{memory}+0x{offset:x} {compare} {value}");
                let holds = || -> Result<bool> {
                    let current = env.memory().read32(mapping.vas, mapping.va)?;
                    tracing::trace!("#{id}: {condition}? read {current}");
                    Ok(compare.holds(current, value))
                };

                let progress = if env.blocking() {
                    poll::block_until(id, &condition, timeout, env.options().poll_interval, holds)?
                } else {
                    let started = *self.poll.started.get_or_insert_with(Instant::now);
                    let holds = holds()?;
                    poll::check(id, &condition, started, timeout, holds)?
                };

                if progress == Progress::Done {
                    if let Some(mut polled) = self.poll.mapping.take() {
                        polled.release()?;
                    }
                }

                Ok(progress)
            }
            OpKind::Delay(delay) => {
                let started = *self.poll.started.get_or_insert_with(Instant::now);
                let remaining = delay.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    Ok(Progress::Done)
                } else if env.blocking() {
                    std::thread::sleep(remaining);
                    Ok(Progress::Done)
                } else {
                    Ok(Progress::Pending)
                }
            }
            OpKind::Checkpoint { kind, group } => {
                group.run(*kind, env.context())?;
                Ok(Progress::Done)
            }
            OpKind::Custom(step) => step.run(env),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.id, self.kind.describe())
    }
}

fn map_for_polling(
    env: &mut DriveEnv<'_>,
    memory: MemHandle,
    offset: u64,
) -> Result<VirtualMapping> {
    let context = env.context().id();
    let vas = env.context().vas();
    let device = env.memory();

    device.duplicate(memory, context)?;
    let mapping = device.alloc_virtual(vas, 4)?;
    if let Err(err) = device.bind(&mapping, memory, offset) {
        if let Err(unmap) = device.unmap(&mapping) {
            tracing::warn!("failed to return 0x{:x} after bind error: {unmap}", mapping.va);
        }
        return Err(ReplayError::Device(err));
    }

    tracing::trace!("mapped {memory}+0x{offset:x} at 0x{:x} for polling", mapping.va);
    Ok(mapping)
}
