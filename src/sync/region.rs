use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    device::{ContextId, DeviceError, DeviceMemory, MemHandle, VasHandle, VirtualMapping},
    error::{InvariantError, ReplayError, Result},
};

fn resource(action: &'static str) -> impl FnOnce(DeviceError) -> ReplayError {
    move |source| ReplayError::Resource { action, source }
}

/// One 32-bit counter.
pub const SEMAPHORE_REGION_SIZE: u64 = 4;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotKind {
    BarrierEnter,
    BarrierExit,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::BarrierEnter => f.write_str("enter"),
            SlotKind::BarrierExit => f.write_str("exit"),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotKey {
    pub checkpoint: String,
    pub kind: SlotKind,
}

impl SlotKey {
    pub fn new(checkpoint: impl Into<String>, kind: SlotKind) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            kind,
        }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.checkpoint, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHandle {
    pub key: SlotKey,
    pub mem: MemHandle,
}

struct Region {
    mem: MemHandle,
    refs: usize,
    mappings: HashMap<(ContextId, VasHandle), VirtualMapping>,
}

/// Device-resident counters shared by every context of a run.
///
/// Allocation, mapping and teardown all happen under one lock. The counter
/// contents are left to the checkpoint protocol.
pub struct SemaphorePool {
    memory: Arc<dyn DeviceMemory>,
    regions: Mutex<HashMap<SlotKey, Region>>,
}

impl SemaphorePool {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self {
            memory,
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SlotKey, Region>> {
        self.regions.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("semaphore pool is poisoned!");
            poisoned.into_inner()
        })
    }

    /// A failed allocation leaves the slot untouched.
    pub fn acquire(&self, key: &SlotKey) -> Result<RegionHandle> {
        let mut regions = self.lock();

        if let Some(region) = regions.get_mut(key) {
            region.refs += 1;
            tracing::trace!("pool: {key} refs -> {}", region.refs);
            return Ok(RegionHandle {
                key: key.clone(),
                mem: region.mem,
            });
        }

        let mem = self
            .memory
            .alloc_physical(SEMAPHORE_REGION_SIZE)
            .map_err(resource("allocate"))?;
        tracing::debug!("pool: allocated {mem} for {key}");

        regions.insert(
            key.clone(),
            Region {
                mem,
                refs: 1,
                mappings: HashMap::new(),
            },
        );

        Ok(RegionHandle {
            key: key.clone(),
            mem,
        })
    }

    pub fn release(&self, key: &SlotKey) -> Result<()> {
        let mut regions = self.lock();

        let region = regions
            .get_mut(key)
            .ok_or_else(|| InvariantError::UnknownSlot(key.clone()).into_error())?;
        region.refs -= 1;
        tracing::trace!("pool: {key} refs -> {}", region.refs);
        if region.refs > 0 {
            return Ok(());
        }

        if let Some(region) = regions.remove(key) {
            tracing::debug!("pool: freeing {} for {key}", region.mem);
            self.destroy(region)?;
        }

        Ok(())
    }

    /// Mappings go first, the physical allocation last. Every step is
    /// attempted even if an earlier one fails; the first failure is returned.
    fn destroy(&self, region: Region) -> Result<()> {
        let mut first: Option<DeviceError> = None;

        for mapping in region.mappings.values() {
            if let Err(err) = self.memory.unmap(mapping) {
                tracing::warn!("pool: failed to unmap 0x{:x}: {err}", mapping.va);
                first.get_or_insert(err);
            }
        }

        if let Err(err) = self.memory.free_physical(region.mem) {
            tracing::warn!("pool: failed to free {}: {err}", region.mem);
            first.get_or_insert(err);
        }

        match first {
            Some(source) => Err(resource("free")(source)),
            None => Ok(()),
        }
    }

    pub fn map(&self, region: &RegionHandle, context: ContextId, vas: VasHandle) -> Result<u64> {
        let mut regions = self.lock();

        let entry = regions
            .get_mut(&region.key)
            .ok_or_else(|| InvariantError::UnknownSlot(region.key.clone()).into_error())?;
        if entry.mem != region.mem {
            return Err(InvariantError::StaleRegion(region.key.clone()).into());
        }

        if let Some(mapping) = entry.mappings.get(&(context, vas)) {
            tracing::trace!(
                "pool: {} already mapped for {context} at 0x{:x}",
                region.key,
                mapping.va
            );
            return Ok(mapping.va);
        }

        self.memory
            .duplicate(entry.mem, context)
            .map_err(resource("share"))?;
        let mapping = self
            .memory
            .alloc_virtual(vas, SEMAPHORE_REGION_SIZE)
            .map_err(resource("reserve"))?;
        if let Err(source) = self.memory.bind(&mapping, entry.mem, 0) {
            if let Err(err) = self.memory.unmap(&mapping) {
                tracing::warn!(
                    "pool: failed to return 0x{:x} after bind error: {err}",
                    mapping.va
                );
            }
            return Err(resource("bind")(source));
        }

        tracing::debug!(
            "pool: mapped {} for {context} in {vas} at 0x{:x}",
            region.key,
            mapping.va
        );
        entry.mappings.insert((context, vas), mapping);

        Ok(mapping.va)
    }

    /// Reset the counter through host memory. Only valid while no device
    /// command references the region.
    pub fn zero(&self, region: &RegionHandle) -> Result<()> {
        self.memory
            .write_physical32(region.mem, 0, 0)
            .map_err(resource("zero"))
    }

    pub fn ref_count(&self, key: &SlotKey) -> usize {
        self.lock().get(key).map(|r| r.refs).unwrap_or(0)
    }

    pub fn mapping_count(&self, key: &SlotKey) -> usize {
        self.lock().get(key).map(|r| r.mappings.len()).unwrap_or(0)
    }

    pub fn active_slots(&self) -> Vec<SlotKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Free everything still held. Anything left at this point leaked a
    /// reference.
    pub fn teardown(&self) -> Result<()> {
        let regions: Vec<_> = self.lock().drain().collect();
        let mut result = Ok(());

        for (key, region) in regions {
            tracing::warn!("pool: {key} still has {} references at teardown", region.refs);
            if let Err(err) = self.destroy(region) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }
}
