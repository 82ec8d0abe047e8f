use std::{sync::Arc, time::Instant};

use crate::{
    config::EngineOptions,
    device::{CommandQueue, DeviceMemory, ExecutionContext},
    error::{InvariantError, ReplayError, Result},
};

use super::{
    graph::OperationGraph,
    op::{OpId, OpStatus, Progress, TriggerPoint},
};

/// What an operation gets to work with while it is being advanced.
pub struct DriveEnv<'a> {
    context: &'a mut dyn ExecutionContext,
    memory: &'a Arc<dyn DeviceMemory>,
    options: &'a EngineOptions,
    op: OpId,
    blocking: bool,
}

impl<'a> DriveEnv<'a> {
    pub fn new(
        context: &'a mut dyn ExecutionContext,
        memory: &'a Arc<dyn DeviceMemory>,
        options: &'a EngineOptions,
        op: OpId,
        blocking: bool,
    ) -> Self {
        Self {
            context,
            memory,
            options,
            op,
            blocking,
        }
    }

    pub fn queue(&mut self) -> &mut dyn CommandQueue {
        self.context.queue()
    }

    pub fn context(&mut self) -> &mut dyn ExecutionContext {
        &mut *self.context
    }

    pub fn memory(&self) -> &'a dyn DeviceMemory {
        let memory: &'a Arc<dyn DeviceMemory> = self.memory;
        memory.as_ref()
    }

    /// Owned handle, for state that has to outlive this call.
    pub fn shared_memory(&self) -> Arc<dyn DeviceMemory> {
        self.memory.clone()
    }

    pub fn options(&self) -> &'a EngineOptions {
        self.options
    }

    /// The operation being advanced.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// True when nobody will call back, so waits have to block in place.
    pub fn blocking(&self) -> bool {
        self.blocking
    }
}

/// Outcome of one drive pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriveReport {
    pub invoked: usize,
    pub completed: usize,
    pub pending: usize,
    /// Skipped because a dependency is not done yet.
    pub waiting: usize,
    /// Not done after this pass, within the driven trigger point.
    pub remaining: usize,
}

impl DriveReport {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    fn stalled(&self) -> bool {
        self.invoked == 0 && self.remaining > 0
    }
}

/// Drives the operation graph of one execution context.
pub struct Driver<'a> {
    context: &'a mut dyn ExecutionContext,
    memory: Arc<dyn DeviceMemory>,
    options: EngineOptions,
}

impl<'a> Driver<'a> {
    pub fn new(
        context: &'a mut dyn ExecutionContext,
        memory: Arc<dyn DeviceMemory>,
        options: EngineOptions,
    ) -> Self {
        Self {
            context,
            memory,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// One pass over every ready operation regardless of trigger point.
    pub fn drive(&mut self, graph: &mut OperationGraph) -> Result<DriveReport> {
        self.pass(graph, None)
    }

    pub fn drive_at(
        &mut self,
        graph: &mut OperationGraph,
        trigger: TriggerPoint,
    ) -> Result<DriveReport> {
        self.pass(graph, Some(trigger))
    }

    fn pass(
        &mut self,
        graph: &mut OperationGraph,
        trigger: Option<TriggerPoint>,
    ) -> Result<DriveReport> {
        let blocking = !graph.enforcing();
        let context = self.context.id();
        let mut report = DriveReport::default();

        for id in graph.ids() {
            let Some(op) = graph.get(id) else {
                continue;
            };
            if op.status() == OpStatus::Done {
                continue;
            }
            if trigger.is_some_and(|trigger| op.trigger_point() != trigger) {
                continue;
            }

            if !graph.check_ready(id)? {
                report.waiting += 1;
                continue;
            }

            let op = graph
                .get_mut(id)
                .ok_or_else(|| InvariantError::UnknownOperation(id).into_error())?;
            op.set_status(OpStatus::Default);
            report.invoked += 1;

            let mut env = DriveEnv::new(
                &mut *self.context,
                &self.memory,
                &self.options,
                id,
                blocking,
            );
            match op.advance(&mut env) {
                Ok(Progress::Done) => {
                    tracing::trace!("driver[{context}]: {op} done");
                    op.set_status(OpStatus::Done);
                    report.completed += 1;
                }
                Ok(Progress::Pending) => {
                    tracing::trace!("driver[{context}]: {op} pending");
                    op.set_status(OpStatus::Pending);
                    report.pending += 1;
                }
                Err(err) => {
                    tracing::warn!("driver[{context}]: {op} failed: {err}");
                    return Err(err);
                }
            }
        }

        report.remaining = graph.outstanding(trigger);
        Ok(report)
    }

    /// Drive every trigger point until the graph is exhausted. Returns the
    /// number of passes it took.
    pub fn run_to_completion(&mut self, graph: &mut OperationGraph) -> Result<usize> {
        self.run(graph, None)
    }

    pub fn run_to_completion_at(
        &mut self,
        graph: &mut OperationGraph,
        trigger: TriggerPoint,
    ) -> Result<usize> {
        self.run(graph, Some(trigger))
    }

    fn run(&mut self, graph: &mut OperationGraph, trigger: Option<TriggerPoint>) -> Result<usize> {
        let started = Instant::now();
        let mut passes = 0;

        loop {
            let report = self.pass(graph, trigger)?;
            passes += 1;

            if report.is_exhausted() {
                tracing::debug!(
                    "driver[{}]: exhausted after {passes} passes",
                    self.context.id()
                );
                return Ok(passes);
            }

            if report.stalled() {
                return Err(InvariantError::Deadlock {
                    remaining: report.remaining,
                }
                .into());
            }

            if let Some(timeout) = self.options.global_timeout {
                if started.elapsed() >= timeout {
                    return Err(ReplayError::GlobalTimeout {
                        timeout,
                        remaining: report.remaining,
                    });
                }
            }

            if report.completed == 0 {
                std::thread::sleep(self.options.poll_interval);
            }
        }
    }
}
