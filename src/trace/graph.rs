use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::EngineOptions,
    error::{InvariantError, Result},
};

use super::op::{OpId, OpStatus, Operation, TriggerPoint};

/// Operations of one test run, iterated in id order.
///
/// Every operation starts out depending on the one issued right before it.
/// The first explicit dependency replaces that default, later ones append.
pub struct OperationGraph {
    ops: BTreeMap<OpId, Operation>,
    /// Every id ever inserted, evicted or not. `push_at` may leave gaps.
    issued: BTreeSet<OpId>,
    next_id: OpId,
    last: Option<OpId>,
    enforce: bool,
}

impl Default for OperationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGraph {
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            issued: BTreeSet::new(),
            next_id: 0,
            last: None,
            enforce: true,
        }
    }

    pub fn with_options(options: &EngineOptions) -> Self {
        let mut graph = Self::new();
        graph.set_enforcement(options.enforce_dependencies);
        graph
    }

    /// With enforcement off every operation is ready immediately and pollable
    /// operations block instead of reporting `Pending`.
    pub fn set_enforcement(&mut self, enforce: bool) {
        self.enforce = enforce;
    }

    pub fn enforcing(&self) -> bool {
        self.enforce
    }

    pub fn push(&mut self, op: Operation) -> OpId {
        let id = self.next_id;
        self.insert(id, op)
    }

    /// Insert with a caller derived id, e.g. a position in the source trace.
    pub fn push_at(&mut self, id: OpId, op: Operation) -> Result<OpId> {
        if let Some(last) = self.last {
            if id <= last {
                return Err(InvariantError::IdOutOfOrder { id, last }.into());
            }
        }

        Ok(self.insert(id, op))
    }

    fn insert(&mut self, id: OpId, mut op: Operation) -> OpId {
        op.id = id;
        op.deps.clear();
        op.implicit_dep = false;
        if let Some(last) = self.last {
            op.deps.push_back(last);
            op.implicit_dep = true;
        }

        tracing::trace!("graph: issued {op}");
        self.ops.insert(id, op);
        self.issued.insert(id);
        self.last = Some(id);
        self.next_id = id + 1;

        id
    }

    pub fn depend_on(&mut self, op: OpId, dep: OpId) -> Result<()> {
        if op == dep {
            return Err(InvariantError::SelfDependency(op).into());
        }
        if !self.issued.contains(&dep) {
            return Err(InvariantError::UnknownDependency { op, dep }.into());
        }

        let entry = self
            .ops
            .get_mut(&op)
            .ok_or_else(|| InvariantError::UnknownOperation(op).into_error())?;
        if entry.implicit_dep {
            entry.deps.clear();
            entry.implicit_dep = false;
        }
        entry.deps.push_back(dep);

        Ok(())
    }

    /// Drain `op`'s dependency queue from the front for as long as the front
    /// dependency is done or gone. A drained dependency is never looked at
    /// again.
    pub fn check_ready(&mut self, op: OpId) -> Result<bool> {
        if !self.enforce {
            return Ok(true);
        }

        loop {
            let front = self
                .ops
                .get(&op)
                .ok_or_else(|| InvariantError::UnknownOperation(op).into_error())?
                .deps
                .front()
                .copied();

            let Some(dep) = front else {
                return Ok(true);
            };

            let satisfied = self
                .ops
                .get(&dep)
                .map(|dep| dep.status() == OpStatus::Done)
                .unwrap_or(true);
            if !satisfied {
                tracing::trace!("graph: #{op} waiting on #{dep}");
                return Ok(false);
            }

            if let Some(entry) = self.ops.get_mut(&op) {
                entry.deps.pop_front();
                entry.implicit_dep = false;
            }
        }
    }

    pub fn get(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(&id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        self.ops.get_mut(&id)
    }

    pub fn status(&self, id: OpId) -> Option<OpStatus> {
        self.ops.get(&id).map(|op| op.status())
    }

    pub fn remove(&mut self, id: OpId) -> Option<Operation> {
        self.ops.remove(&id)
    }

    /// Drop every completed operation. Operations depending on them treat
    /// them as satisfied from then on.
    pub fn evict_done(&mut self) -> usize {
        let before = self.ops.len();
        self.ops.retain(|_, op| op.status() != OpStatus::Done);
        let evicted = before - self.ops.len();
        if evicted > 0 {
            tracing::trace!("graph: evicted {evicted} operations");
        }
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }

    pub fn ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    pub fn ids_at(&self, trigger: TriggerPoint) -> Vec<OpId> {
        self.ops
            .values()
            .filter(|op| op.trigger_point() == trigger)
            .map(|op| op.id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn outstanding(&self, trigger: Option<TriggerPoint>) -> usize {
        self.ops
            .values()
            .filter(|op| trigger.map(|t| op.trigger_point() == t).unwrap_or(true))
            .filter(|op| op.status() != OpStatus::Done)
            .count()
    }

    pub fn is_exhausted(&self) -> bool {
        self.outstanding(None) == 0
    }

    pub fn is_exhausted_at(&self, trigger: TriggerPoint) -> bool {
        self.outstanding(Some(trigger)) == 0
    }
}
