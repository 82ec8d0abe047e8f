//! Enter/exit checkpoints shared by several execution contexts.
//!
//! One coordinator and any number of workers meet at a named checkpoint. The
//! coordinator learns that the workers have arrived through a host semaphore;
//! workers never block their host thread on the barrier and instead park their
//! own command stream on a device-side acquire of a pooled semaphore region.
//!
//! Enter:
//! 1. everyone flushes and waits for its own stream to go idle
//! 2. the coordinator zeroes both counters and maps them for every participant
//! 3. everyone meets at the host rendezvous
//! 4. workers inject `acquire(enter >= step)`, flush, then signal
//! 5. the coordinator waits for every signal and injects `release(enter += step)`
//!
//! Exit swaps who waits on the device: workers inject `release(exit += step)`
//! and signal, the coordinator injects `NOP`, `acquire(exit >= workers * step)`,
//! `WFI` and waits for its stream to go idle.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    config::EngineOptions,
    device::{Command, ContextId, ExecutionContext, VasHandle},
    error::{InvariantError, ReplayError, Result},
};

use super::{
    host::HostSemaphore,
    region::{RegionHandle, SemaphorePool, SlotKey, SlotKind},
    rendezvous::Rendezvous,
};

pub const DEFAULT_RELEASE_STEP: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Enter,
    Exit,
}

impl CheckpointKind {
    pub fn slot(&self) -> SlotKind {
        match self {
            CheckpointKind::Enter => SlotKind::BarrierEnter,
            CheckpointKind::Exit => SlotKind::BarrierExit,
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.slot(), f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participant {
    pub context: ContextId,
    pub vas: VasHandle,
}

impl Participant {
    pub fn new(context: ContextId, vas: VasHandle) -> Self {
        Self { context, vas }
    }

    pub fn of(ctx: &mut dyn ExecutionContext) -> Self {
        Self {
            context: ctx.id(),
            vas: ctx.vas(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Entered,
}

impl Phase {
    fn describe(&self) -> &'static str {
        match self {
            Phase::Idle => "outside the checkpoint",
            Phase::Entered => "inside the checkpoint",
        }
    }
}

/// Device counters are 32 bits wide and the exit target is `workers * step`.
fn exit_target(checkpoint: &str, step: u32, workers: usize) -> Result<u32> {
    u32::try_from(workers)
        .ok()
        .and_then(|workers| workers.checked_mul(step))
        .filter(|_| step > 0)
        .ok_or_else(|| {
            InvariantError::InvalidStep {
                checkpoint: checkpoint.to_string(),
                step,
                workers,
            }
            .into_error()
        })
}

struct Members {
    workers: Vec<Participant>,
    phases: HashMap<ContextId, Phase>,
}

pub struct CheckpointGroupBuilder {
    name: String,
    pool: Arc<SemaphorePool>,
    rendezvous: Arc<dyn Rendezvous>,
    coordinator: Option<Participant>,
    workers: Vec<Participant>,
    step: u32,
    idle_timeout: Duration,
}

impl CheckpointGroupBuilder {
    pub fn coordinator(mut self, participant: Participant) -> Self {
        self.coordinator = Some(participant);
        self
    }

    pub fn worker(mut self, participant: Participant) -> Self {
        self.workers.push(participant);
        self
    }

    pub fn workers(mut self, participants: impl IntoIterator<Item = Participant>) -> Self {
        self.workers.extend(participants);
        self
    }

    pub fn step(mut self, step: u32) -> Self {
        self.step = step;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Takes the release step and idle timeout from the engine configuration.
    pub fn options(self, options: &EngineOptions) -> Self {
        self.step(options.release_step)
            .idle_timeout(options.effective_timeout(options.default_timeout))
    }

    pub fn build(self) -> Result<Arc<CheckpointGroup>> {
        let coordinator = self.coordinator.ok_or_else(|| {
            InvariantError::MissingCoordinator {
                checkpoint: self.name.clone(),
            }
            .into_error()
        })?;

        let mut phases = HashMap::new();
        phases.insert(coordinator.context, Phase::Idle);
        for worker in &self.workers {
            if phases.insert(worker.context, Phase::Idle).is_some() {
                return Err(InvariantError::DuplicateParticipant {
                    checkpoint: self.name,
                    context: worker.context,
                }
                .into());
            }
        }

        exit_target(&self.name, self.step, self.workers.len())?;

        let enter = self
            .pool
            .acquire(&SlotKey::new(&self.name, SlotKind::BarrierEnter))?;
        let exit = match self
            .pool
            .acquire(&SlotKey::new(&self.name, SlotKind::BarrierExit))
        {
            Ok(exit) => exit,
            Err(err) => {
                if let Err(release) = self.pool.release(&enter.key) {
                    tracing::warn!("{}: failed to release {}: {release}", self.name, enter.key);
                }
                return Err(err);
            }
        };

        tracing::debug!(
            "{}: group of {} workers coordinated by {}",
            self.name,
            self.workers.len(),
            coordinator.context
        );

        Ok(Arc::new(CheckpointGroup {
            name: self.name,
            pool: self.pool,
            rendezvous: self.rendezvous,
            coordinator,
            members: Mutex::new(Members {
                workers: self.workers,
                phases,
            }),
            sealed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            arrivals: HostSemaphore::new(),
            step: self.step,
            idle_timeout: self.idle_timeout,
            enter,
            exit,
            uses: AtomicU64::new(0),
        }))
    }
}

pub struct CheckpointGroup {
    name: String,
    pool: Arc<SemaphorePool>,
    rendezvous: Arc<dyn Rendezvous>,
    coordinator: Participant,
    members: Mutex<Members>,
    sealed: AtomicBool,
    aborted: AtomicBool,
    arrivals: HostSemaphore,
    step: u32,
    idle_timeout: Duration,
    enter: RegionHandle,
    exit: RegionHandle,
    uses: AtomicU64,
}

impl CheckpointGroup {
    pub fn builder(
        name: impl Into<String>,
        pool: Arc<SemaphorePool>,
        rendezvous: Arc<dyn Rendezvous>,
    ) -> CheckpointGroupBuilder {
        CheckpointGroupBuilder {
            name: name.into(),
            pool,
            rendezvous,
            coordinator: None,
            workers: Vec::new(),
            step: DEFAULT_RELEASE_STEP,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("{}: member list is poisoned!", self.name);
            poisoned.into_inner()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> Participant {
        self.coordinator
    }

    pub fn workers(&self) -> Vec<Participant> {
        self.members().workers.clone()
    }

    pub fn participants(&self) -> Vec<Participant> {
        let mut all = vec![self.coordinator];
        all.extend(self.members().workers.iter().copied());
        all
    }

    pub fn participant_count(&self) -> usize {
        1 + self.members().workers.len()
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn region(&self, kind: CheckpointKind) -> &RegionHandle {
        match kind {
            CheckpointKind::Enter => &self.enter,
            CheckpointKind::Exit => &self.exit,
        }
    }

    /// Number of enter checkpoints the coordinator has started.
    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn add_worker(&self, participant: Participant) -> Result<()> {
        let mut members = self.members();
        if self.is_sealed() {
            return Err(InvariantError::ParticipantAfterSeal {
                checkpoint: self.name.clone(),
                context: participant.context,
            }
            .into());
        }
        if members.phases.contains_key(&participant.context) {
            return Err(InvariantError::DuplicateParticipant {
                checkpoint: self.name.clone(),
                context: participant.context,
            }
            .into());
        }

        exit_target(&self.name, self.step, members.workers.len() + 1)?;

        members.phases.insert(participant.context, Phase::Idle);
        members.workers.push(participant);

        Ok(())
    }

    fn key(&self, kind: CheckpointKind) -> String {
        format!("{}:{kind}", self.name)
    }

    fn aborted_error(&self) -> ReplayError {
        ReplayError::Aborted {
            checkpoint: self.name.clone(),
        }
    }

    /// Freeze the member list and return the participant count everyone
    /// meets with. Under the member lock so add_worker can not interleave.
    fn seal(&self) -> usize {
        let members = self.members();
        self.sealed.store(true, Ordering::SeqCst);
        1 + members.workers.len()
    }

    fn role_of(&self, ctx: &mut dyn ExecutionContext) -> Result<(Role, Participant)> {
        let context = ctx.id();
        let members = self.members();

        let (role, participant) = if context == self.coordinator.context {
            (Role::Coordinator, self.coordinator)
        } else if let Some(worker) = members.workers.iter().find(|w| w.context == context) {
            (Role::Worker, *worker)
        } else {
            return Err(InvariantError::UnknownParticipant {
                checkpoint: self.name.clone(),
                context,
            }
            .into());
        };

        let claims_coordinator = ctx.is_coordinator_for_group();
        if claims_coordinator != (role == Role::Coordinator) {
            return Err(InvariantError::RoleMismatch {
                checkpoint: self.name.clone(),
                context,
                claims_coordinator,
            }
            .into());
        }

        let expected = ctx.participant_count();
        let actual = 1 + members.workers.len();
        if expected != actual {
            return Err(InvariantError::ParticipantCountMismatch {
                checkpoint: self.name.clone(),
                expected,
                actual,
            }
            .into());
        }

        Ok((role, participant))
    }

    fn transition(&self, context: ContextId, kind: CheckpointKind) -> Result<()> {
        let mut members = self.members();
        let phase = members.phases.entry(context).or_insert(Phase::Idle);

        let (from, to, action) = match kind {
            CheckpointKind::Enter => (Phase::Idle, Phase::Entered, "enter"),
            CheckpointKind::Exit => (Phase::Entered, Phase::Idle, "exit"),
        };
        if *phase != from {
            return Err(InvariantError::PhaseViolation {
                checkpoint: self.name.clone(),
                context,
                action,
                phase: phase.describe(),
            }
            .into());
        }
        *phase = to;

        Ok(())
    }

    /// Run one checkpoint for `ctx`. Every participant of the group must make
    /// the same call from its own thread.
    pub fn run(&self, kind: CheckpointKind, ctx: &mut dyn ExecutionContext) -> Result<()> {
        if self.is_aborted() {
            return Err(self.aborted_error());
        }

        let (role, me) = self.role_of(ctx)?;
        self.transition(me.context, kind)?;

        tracing::debug!("{}[{}]: {kind} as {role:?}", self.name, me.context);
        let result = match kind {
            CheckpointKind::Enter => self.enter(role, me, ctx),
            CheckpointKind::Exit => self.exit(role, me, ctx),
        };

        if let Err(err) = &result {
            self.abort(err);
        }

        result
    }

    fn enter(&self, role: Role, me: Participant, ctx: &mut dyn ExecutionContext) -> Result<()> {
        self.settle(me, ctx)?;

        if role == Role::Coordinator {
            tracing::debug!("{}[{}]: zeroing counters", self.name, me.context);
            self.pool.zero(&self.enter)?;
            self.pool.zero(&self.exit)?;
            self.uses.fetch_add(1, Ordering::SeqCst);
            self.map_all()?;
        }

        self.meet(CheckpointKind::Enter, me)?;

        let va = self.pool.map(&self.enter, me.context, me.vas)?;
        match role {
            Role::Coordinator => {
                self.wait_for_workers(me)?;
                tracing::debug!("{}[{}]: releasing workers", self.name, me.context);
                let queue = ctx.queue();
                queue.inject_command(&Command::release(va, self.step))?;
                queue.flush()?;
            }
            Role::Worker => {
                self.stall_then_signal(me, ctx, Command::acquire(va, self.step))?;
            }
        }

        Ok(())
    }

    fn exit(&self, role: Role, me: Participant, ctx: &mut dyn ExecutionContext) -> Result<()> {
        self.settle(me, ctx)?;

        if role == Role::Coordinator {
            self.map_all()?;
        }

        self.meet(CheckpointKind::Exit, me)?;

        let va = self.pool.map(&self.exit, me.context, me.vas)?;
        match role {
            Role::Coordinator => {
                let workers = self.members().workers.len();
                let target = exit_target(&self.name, self.step, workers)?;
                self.wait_for_workers(me)?;

                tracing::debug!(
                    "{}[{}]: waiting on device for {workers} releases",
                    self.name,
                    me.context
                );
                let queue = ctx.queue();
                // A lone WFI on an otherwise empty stream can be dropped by the
                // front end, the NOP keeps it honest.
                queue.inject_command(&Command::nop())?;
                queue.inject_command(&Command::acquire(va, target))?;
                queue.inject_command(&Command::wait_for_idle())?;
                queue.flush()?;
                queue.wait_for_local_idle(self.idle_timeout)?;
            }
            Role::Worker => {
                self.stall_then_signal(me, ctx, Command::release(va, self.step))?;
            }
        }

        tracing::debug!("{}[{}]: exited", self.name, me.context);

        Ok(())
    }

    fn settle(&self, me: Participant, ctx: &mut dyn ExecutionContext) -> Result<()> {
        tracing::debug!("{}[{}]: flushing", self.name, me.context);
        let queue = ctx.queue();
        queue.flush()?;
        queue.wait_for_local_idle(self.idle_timeout)?;
        Ok(())
    }

    fn map_all(&self) -> Result<()> {
        for participant in self.participants() {
            self.pool
                .map(&self.enter, participant.context, participant.vas)?;
            self.pool
                .map(&self.exit, participant.context, participant.vas)?;
        }
        Ok(())
    }

    fn meet(&self, kind: CheckpointKind, me: Participant) -> Result<()> {
        let participants = self.seal();
        tracing::debug!(
            "{}[{}]: waiting for {participants} participants at {kind}",
            self.name,
            me.context
        );
        self.rendezvous.arrive(&self.key(kind), participants)
    }

    fn wait_for_workers(&self, me: Participant) -> Result<()> {
        let workers = self.members().workers.len() as u64;
        tracing::debug!(
            "{}[{}]: waiting for {workers} workers",
            self.name,
            me.context
        );
        self.arrivals
            .wait_many(workers)
            .map_err(|_| self.aborted_error())
    }

    /// Emit, flush, then signal. The coordinator may only see the signal once
    /// the command is on the device.
    fn stall_then_signal(
        &self,
        me: Participant,
        ctx: &mut dyn ExecutionContext,
        command: Command,
    ) -> Result<()> {
        tracing::debug!("{}[{}]: injecting {command}", self.name, me.context);
        let queue = ctx.queue();
        queue.inject_command(&command)?;
        queue.flush()?;
        self.arrivals.signal();
        Ok(())
    }

    /// Wake every host waiter of the group with `Aborted`. Workers already
    /// parked on a device acquire stay parked.
    pub fn abort(&self, err: &ReplayError) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::error!("{}: aborting checkpoint: {err}", self.name);
        self.arrivals.poison();
        self.rendezvous.abort(&self.key(CheckpointKind::Enter));
        self.rendezvous.abort(&self.key(CheckpointKind::Exit));
    }
}

impl Drop for CheckpointGroup {
    fn drop(&mut self) {
        // A later group may reuse the name.
        for kind in [CheckpointKind::Enter, CheckpointKind::Exit] {
            self.rendezvous.forget(&self.key(kind));
        }

        for region in [&self.enter, &self.exit] {
            if let Err(err) = self.pool.release(&region.key) {
                tracing::warn!("{}: failed to release {}: {err}", self.name, region.key);
            }
        }
    }
}

impl std::fmt::Debug for CheckpointGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointGroup")
            .field("name", &self.name)
            .field("coordinator", &self.coordinator)
            .field("workers", &self.workers())
            .field("step", &self.step)
            .finish()
    }
}
