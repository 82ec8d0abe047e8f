//! In-memory device used by the test-suite and by dry runs.
//!
//! Every context gets its own in-order channel and address space. Commands
//! retire lazily whenever a host call touches the device; a semaphore acquire
//! whose condition does not hold stalls its channel (and only its channel)
//! until another channel or the host changes the word it watches.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use super::{
    Command, CommandQueue, ContextId, DeviceError, DeviceMemory, ExecutionContext, MemHandle,
    Method, VasHandle, VirtualMapping,
};

const PAGE_SIZE: u64 = 0x1000;
const VA_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub physical_allocs: usize,
    pub physical_frees: usize,
    pub duplicate_calls: usize,
    pub duplicates: usize,
    pub virtual_allocs: usize,
    pub binds: usize,
    pub unmaps: usize,
    pub reads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Injected,
    Retired,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub seq: u64,
    pub context: ContextId,
    pub event: SimEvent,
    pub command: Command,
}

impl LogEntry {
    pub fn is(&self, context: ContextId, event: SimEvent, method: Method) -> bool {
        self.context == context && self.event == event && self.command.kind() == Some(method)
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Fault {
    AllocPhysical,
    AllocVirtual,
    Duplicate,
    Bind,
    Inject,
}

struct Binding {
    size: u64,
    bound: Option<(MemHandle, u64)>,
}

struct AddressSpace {
    owner: ContextId,
    next_va: u64,
    mappings: BTreeMap<u64, Binding>,
}

struct Channel {
    vas: VasHandle,
    queued: Vec<Command>,
    inflight: VecDeque<Command>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    physical: HashMap<MemHandle, Vec<u32>>,
    shared: HashSet<(MemHandle, ContextId)>,
    address_spaces: HashMap<VasHandle, AddressSpace>,
    channels: BTreeMap<ContextId, Channel>,
    log: Vec<LogEntry>,
    stats: SimStats,
    faults: HashSet<Fault>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        self.faults.remove(&fault)
    }

    fn record(&mut self, context: ContextId, event: SimEvent, command: Command) {
        let seq = self.log.len() as u64;
        self.log.push(LogEntry {
            seq,
            context,
            event,
            command,
        });
    }

    fn translate(&self, vas: VasHandle, va: u64) -> Result<(MemHandle, usize), DeviceError> {
        let space = self
            .address_spaces
            .get(&vas)
            .ok_or(DeviceError::InvalidAddressSpace(vas))?;
        let (start, binding) = space
            .mappings
            .range(..=va)
            .next_back()
            .ok_or(DeviceError::Unmapped { vas, va })?;
        if va >= start + binding.size {
            return Err(DeviceError::Unmapped { vas, va });
        }
        let (mem, offset) = binding.bound.ok_or(DeviceError::Unmapped { vas, va })?;

        let offset = offset + (va - start);
        let words = self
            .physical
            .get(&mem)
            .ok_or(DeviceError::InvalidMemory(mem))?;
        let index = (offset / 4) as usize;
        if index >= words.len() {
            return Err(DeviceError::OutOfRange { mem, offset });
        }

        Ok((mem, index))
    }

    fn word(&mut self, vas: VasHandle, va: u64) -> Result<&mut u32, DeviceError> {
        let (mem, index) = self.translate(vas, va)?;
        self.physical
            .get_mut(&mem)
            .map(|words| &mut words[index])
            .ok_or(DeviceError::InvalidMemory(mem))
    }

    /// Returns false if the command has to stall.
    fn execute(&mut self, vas: VasHandle, command: &Command) -> bool {
        let (Some(method), Some((va, payload))) = (command.kind(), command.target()) else {
            return true;
        };

        let word = match self.word(vas, va) {
            Ok(word) => word,
            Err(err) => {
                tracing::warn!("sim: dropping {command}: {err}");
                return true;
            }
        };

        match method {
            Method::SemaphoreAcquire => *word >= payload,
            Method::SemaphoreRelease => {
                *word = word.wrapping_add(payload);
                true
            }
            Method::SemaphoreWrite | Method::Write32 => {
                *word = payload;
                true
            }
            Method::Nop | Method::WaitForIdle => true,
        }
    }

    fn pump(&mut self) {
        loop {
            let mut progress = false;
            let ids: Vec<_> = self.channels.keys().copied().collect();
            for id in ids {
                loop {
                    let Some((vas, command)) = self
                        .channels
                        .get(&id)
                        .and_then(|c| c.inflight.front().map(|cmd| (c.vas, cmd.clone())))
                    else {
                        break;
                    };

                    if !self.execute(vas, &command) {
                        break;
                    }

                    if let Some(channel) = self.channels.get_mut(&id) {
                        channel.inflight.pop_front();
                    }
                    self.record(id, SimEvent::Retired, command);
                    progress = true;
                }
            }

            if !progress {
                break;
            }
        }
    }

    fn channel_idle(&self, context: ContextId) -> bool {
        self.channels
            .get(&context)
            .map(|c| c.inflight.is_empty())
            .unwrap_or(true)
    }
}

#[derive(Default)]
pub struct SimDevice {
    state: Mutex<SimState>,
    retired: Condvar,
}

impl SimDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("sim device state is poisoned!");
            poisoned.into_inner()
        })
    }

    /// Create the channel and private address space for `context`.
    pub fn open_queue(self: &Arc<Self>, context: ContextId) -> SimQueue {
        let mut state = self.lock();
        let vas = VasHandle(state.handle());
        state.address_spaces.insert(
            vas,
            AddressSpace {
                owner: context,
                next_va: VA_BASE,
                mappings: BTreeMap::new(),
            },
        );
        state.channels.insert(
            context,
            Channel {
                vas,
                queued: Vec::new(),
                inflight: VecDeque::new(),
            },
        );

        SimQueue {
            device: self.clone(),
            context,
            vas,
        }
    }

    pub fn open_context(
        self: &Arc<Self>,
        context: ContextId,
        coordinator: bool,
        participants: usize,
    ) -> SimContext {
        SimContext {
            queue: self.open_queue(context),
            coordinator,
            participants,
        }
    }

    /// Make the next call of the given kind fail.
    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }

    pub fn is_allocated(&self, mem: MemHandle) -> bool {
        self.lock().physical.contains_key(&mem)
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().physical.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.lock()
            .address_spaces
            .values()
            .map(|space| space.mappings.len())
            .sum()
    }

    pub fn read_physical32(&self, mem: MemHandle, offset: u64) -> Result<u32, DeviceError> {
        let state = self.lock();
        let words = state
            .physical
            .get(&mem)
            .ok_or(DeviceError::InvalidMemory(mem))?;
        words
            .get((offset / 4) as usize)
            .copied()
            .ok_or(DeviceError::OutOfRange { mem, offset })
    }

    pub fn inflight(&self, context: ContextId) -> usize {
        self.lock()
            .channels
            .get(&context)
            .map(|c| c.inflight.len())
            .unwrap_or(0)
    }
}

impl DeviceMemory for SimDevice {
    fn alloc_physical(&self, size: u64) -> Result<MemHandle, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::AllocPhysical) {
            return Err(DeviceError::OutOfMemory(size));
        }

        let mem = MemHandle(state.handle());
        state.physical.insert(mem, vec![0; size.div_ceil(4) as usize]);
        state.stats.physical_allocs += 1;

        Ok(mem)
    }

    fn free_physical(&self, mem: MemHandle) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state
            .physical
            .remove(&mem)
            .ok_or(DeviceError::InvalidMemory(mem))?;
        state.shared.retain(|(shared, _)| *shared != mem);
        state.stats.physical_frees += 1;

        Ok(())
    }

    fn duplicate(&self, mem: MemHandle, context: ContextId) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.stats.duplicate_calls += 1;
        if state.take_fault(Fault::Duplicate) {
            return Err(DeviceError::NotShared { mem, context });
        }
        if !state.physical.contains_key(&mem) {
            return Err(DeviceError::InvalidMemory(mem));
        }

        if state.shared.insert((mem, context)) {
            state.stats.duplicates += 1;
        }

        Ok(())
    }

    fn alloc_virtual(&self, vas: VasHandle, size: u64) -> Result<VirtualMapping, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::AllocVirtual) {
            return Err(DeviceError::OutOfMemory(size));
        }

        let space = state
            .address_spaces
            .get_mut(&vas)
            .ok_or(DeviceError::InvalidAddressSpace(vas))?;
        let va = space.next_va;
        space.next_va += size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        space.mappings.insert(va, Binding { size, bound: None });
        state.stats.virtual_allocs += 1;

        Ok(VirtualMapping { vas, va, size })
    }

    fn bind(
        &self,
        mapping: &VirtualMapping,
        mem: MemHandle,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::Bind) {
            return Err(DeviceError::Unmapped {
                vas: mapping.vas,
                va: mapping.va,
            });
        }

        let len = state
            .physical
            .get(&mem)
            .map(|words| words.len() as u64 * 4)
            .ok_or(DeviceError::InvalidMemory(mem))?;
        if offset + mapping.size > len {
            return Err(DeviceError::OutOfRange { mem, offset });
        }

        let owner = state
            .address_spaces
            .get(&mapping.vas)
            .map(|space| space.owner)
            .ok_or(DeviceError::InvalidAddressSpace(mapping.vas))?;
        if !state.shared.contains(&(mem, owner)) {
            return Err(DeviceError::NotShared {
                mem,
                context: owner,
            });
        }

        let binding = state
            .address_spaces
            .get_mut(&mapping.vas)
            .and_then(|space| space.mappings.get_mut(&mapping.va))
            .ok_or(DeviceError::Unmapped {
                vas: mapping.vas,
                va: mapping.va,
            })?;
        binding.bound = Some((mem, offset));
        state.stats.binds += 1;

        Ok(())
    }

    fn unmap(&self, mapping: &VirtualMapping) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state
            .address_spaces
            .get_mut(&mapping.vas)
            .and_then(|space| space.mappings.remove(&mapping.va))
            .ok_or(DeviceError::Unmapped {
                vas: mapping.vas,
                va: mapping.va,
            })?;
        state.stats.unmaps += 1;

        Ok(())
    }

    fn read32(&self, vas: VasHandle, va: u64) -> Result<u32, DeviceError> {
        let mut state = self.lock();
        state.pump();
        state.stats.reads += 1;
        Ok(*state.word(vas, va)?)
    }

    fn write_physical32(&self, mem: MemHandle, offset: u64, value: u32) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let words = state
            .physical
            .get_mut(&mem)
            .ok_or(DeviceError::InvalidMemory(mem))?;
        let word = words
            .get_mut((offset / 4) as usize)
            .ok_or(DeviceError::OutOfRange { mem, offset })?;
        *word = value;

        state.pump();
        drop(state);
        self.retired.notify_all();

        Ok(())
    }
}

pub struct SimQueue {
    device: Arc<SimDevice>,
    context: ContextId,
    vas: VasHandle,
}

impl SimQueue {
    pub fn device(&self) -> &Arc<SimDevice> {
        &self.device
    }
}

impl CommandQueue for SimQueue {
    fn flush(&mut self) -> Result<(), DeviceError> {
        let mut state = self.device.lock();
        if let Some(channel) = state.channels.get_mut(&self.context) {
            let queued = std::mem::take(&mut channel.queued);
            channel.inflight.extend(queued);
        }
        state.pump();
        drop(state);
        self.device.retired.notify_all();

        Ok(())
    }

    fn wait_for_local_idle(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.device.lock();
        state.pump();

        while !state.channel_idle(self.context) {
            // No representable deadline means wait forever.
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DeviceError::IdleTimeout(timeout));
                    }
                    deadline - now
                }
                None => Duration::from_secs(3600),
            };

            state = match self.device.retired.wait_timeout(state, wait) {
                Ok((state, _)) => state,
                Err(poisoned) => {
                    tracing::warn!("sim device state is poisoned!");
                    poisoned.into_inner().0
                }
            };
            state.pump();
        }

        Ok(())
    }

    fn is_idle(&mut self) -> Result<bool, DeviceError> {
        let mut state = self.device.lock();
        state.pump();
        Ok(state.channel_idle(self.context))
    }

    fn inject(&mut self, method: u32, data: &[u32]) -> Result<(), DeviceError> {
        let command = Command::raw(method, data);
        let mut state = self.device.lock();
        if state.take_fault(Fault::Inject) {
            return Err(DeviceError::Rejected {
                method,
                reason: "injected fault".to_string(),
            });
        }

        if let Some(kind) = command.kind() {
            if data.len() < kind.operand_count() {
                return Err(DeviceError::Rejected {
                    method,
                    reason: format!("{kind} takes {} operands", kind.operand_count()),
                });
            }
            if let Some((va, _)) = command.target() {
                if kind.operand_count() > 0 {
                    state.translate(self.vas, va).map_err(|err| DeviceError::Rejected {
                        method,
                        reason: err.to_string(),
                    })?;
                }
            }
        }

        let channel = state
            .channels
            .get_mut(&self.context)
            .ok_or(DeviceError::InvalidAddressSpace(self.vas))?;
        channel.queued.push(command.clone());
        state.record(self.context, SimEvent::Injected, command);

        Ok(())
    }

    fn vas(&self) -> VasHandle {
        self.vas
    }

    fn submission_id(&self) -> ContextId {
        self.context
    }
}

pub struct SimContext {
    pub queue: SimQueue,
    pub coordinator: bool,
    pub participants: usize,
}

impl ExecutionContext for SimContext {
    fn queue(&mut self) -> &mut dyn CommandQueue {
        &mut self.queue
    }

    fn is_coordinator_for_group(&self) -> bool {
        self.coordinator
    }

    fn participant_count(&self) -> usize {
        self.participants
    }
}
