use std::{sync::Arc, time::Duration};

use replay_rs::{
    device::{
        sim::{Fault, LogEntry, SimContext, SimDevice, SimEvent},
        ContextId, DeviceError, Method,
    },
    error::InvariantError,
    sync::{CheckpointGroup, CheckpointKind, HostRendezvous, Participant, SemaphorePool},
    trace::{Driver, OpKind, Operation, OperationGraph},
    EngineOptions, ReplayError,
};

#[ctor::ctor]
fn test_init() {
    tracing_subscriber::util::SubscriberInitExt::init(
        tracing_subscriber::layer::SubscriberExt::with(
            tracing_subscriber::layer::SubscriberExt::with(
                tracing_subscriber::registry(),
                tracing_subscriber::fmt::layer(),
            ),
            tracing_subscriber::filter::EnvFilter::from_default_env(),
        ),
    );
}

const COORDINATOR: ContextId = 0;

struct Rig {
    device: Arc<SimDevice>,
    pool: Arc<SemaphorePool>,
    rendezvous: Arc<HostRendezvous>,
    coordinator: SimContext,
    workers: Vec<SimContext>,
}

impl Rig {
    fn new(workers: u32) -> Self {
        let device = SimDevice::new();
        let participants = workers as usize + 1;
        Self {
            pool: Arc::new(SemaphorePool::new(device.clone())),
            rendezvous: Arc::new(HostRendezvous::new()),
            coordinator: device.open_context(COORDINATOR, true, participants),
            workers: (1..=workers)
                .map(|id| device.open_context(id, false, participants))
                .collect(),
            device,
        }
    }

    fn group(&mut self, name: &str, options: &EngineOptions) -> Arc<CheckpointGroup> {
        let workers: Vec<_> = self
            .workers
            .iter_mut()
            .map(|ctx| Participant::of(ctx))
            .collect();
        CheckpointGroup::builder(name, self.pool.clone(), self.rendezvous.clone())
            .coordinator(Participant::of(&mut self.coordinator))
            .workers(workers)
            .options(options)
            .build()
            .unwrap()
    }

    /// Every participant runs enter then exit from its own thread.
    fn run(&mut self, group: &Arc<CheckpointGroup>) {
        std::thread::scope(|s| {
            for ctx in std::iter::once(&mut self.coordinator).chain(self.workers.iter_mut()) {
                let group = group.clone();
                s.spawn(move || {
                    group.run(CheckpointKind::Enter, &mut *ctx).unwrap();
                    group.run(CheckpointKind::Exit, &mut *ctx).unwrap();
                });
            }
        });
    }
}

fn seq_of(log: &[LogEntry], context: ContextId, event: SimEvent, method: Method) -> Vec<u64> {
    log.iter()
        .filter(|e| e.is(context, event, method))
        .map(|e| e.seq)
        .collect()
}

#[test]
fn enter_and_exit_order_commands() {
    let mut rig = Rig::new(3);
    let group = rig.group("order", &EngineOptions::new());
    rig.run(&group);

    let log = rig.device.log();
    let release = seq_of(&log, COORDINATOR, SimEvent::Injected, Method::SemaphoreRelease);
    assert_eq!(release.len(), 1);
    let release = release[0];

    for worker in 1..=3 {
        let acquire = seq_of(&log, worker, SimEvent::Injected, Method::SemaphoreAcquire);
        assert_eq!(acquire.len(), 1);
        assert!(acquire[0] < release, "worker {worker} acquired after release");

        let retired = seq_of(&log, worker, SimEvent::Retired, Method::SemaphoreAcquire);
        assert!(retired[0] > release, "worker {worker} passed before release");
    }

    // Exit on the coordinator: NOP, then acquire, then WFI.
    let ours: Vec<_> = log
        .iter()
        .filter(|e| e.context == COORDINATOR && e.event == SimEvent::Injected)
        .filter_map(|e| e.command.kind())
        .collect();
    assert_eq!(
        ours,
        vec![
            Method::SemaphoreRelease,
            Method::Nop,
            Method::SemaphoreAcquire,
            Method::WaitForIdle
        ]
    );

    let passed = seq_of(&log, COORDINATOR, SimEvent::Retired, Method::SemaphoreAcquire)[0];
    for worker in 1..=3 {
        let released = seq_of(&log, worker, SimEvent::Retired, Method::SemaphoreRelease)[0];
        assert!(released < passed);
    }

    let enter = group.region(CheckpointKind::Enter).mem;
    let exit = group.region(CheckpointKind::Exit).mem;
    assert_eq!(rig.device.read_physical32(enter, 0).unwrap(), 1);
    assert_eq!(rig.device.read_physical32(exit, 0).unwrap(), 3);
    for id in 0..=3 {
        assert_eq!(rig.device.inflight(id), 0);
    }
    assert_eq!(group.uses(), 1);
}

#[test]
fn counters_are_zeroed_for_every_use() {
    let mut rig = Rig::new(2);
    let options = EngineOptions::new().release_step(2);
    let group = rig.group("reuse", &options);
    assert_eq!(group.step(), 2);

    rig.run(&group);
    rig.run(&group);
    assert_eq!(group.uses(), 2);

    let exit = group.region(CheckpointKind::Exit).mem;
    assert_eq!(rig.device.read_physical32(exit, 0).unwrap(), 4);

    // Three participants each mapped enter and exit once.
    assert_eq!(rig.device.stats().binds, 6);

    // A later group under the same name gets the same slot, zeroed again.
    drop(group);
    assert!(rig.pool.active_slots().is_empty());
    let group = rig.group("reuse", &options);
    rig.run(&group);
    let exit = group.region(CheckpointKind::Exit).mem;
    assert_eq!(rig.device.read_physical32(exit, 0).unwrap(), 4);
}

#[test]
fn checkpoints_run_from_a_graph() {
    let mut rig = Rig::new(1);
    let group = rig.group("graph", &EngineOptions::new());
    let device = rig.device.clone();

    std::thread::scope(|s| {
        for ctx in std::iter::once(&mut rig.coordinator).chain(rig.workers.iter_mut()) {
            let group = group.clone();
            let device = device.clone();
            s.spawn(move || {
                let mut graph = OperationGraph::new();
                graph.push(Operation::new(OpKind::Checkpoint {
                    kind: CheckpointKind::Enter,
                    group: group.clone(),
                }));
                graph.push(Operation::new(OpKind::Flush));
                graph.push(Operation::new(OpKind::Checkpoint {
                    kind: CheckpointKind::Exit,
                    group,
                }));

                let mut driver = Driver::new(ctx, device.clone(), EngineOptions::new());
                driver.run_to_completion(&mut graph).unwrap();
            });
        }
    });

    assert_eq!(group.uses(), 1);
}

#[test]
fn lone_coordinator_passes_straight_through() {
    let mut rig = Rig::new(0);
    let group = rig.group("solo", &EngineOptions::new());
    assert!(!group.is_sealed());

    group.run(CheckpointKind::Enter, &mut rig.coordinator).unwrap();
    assert!(group.is_sealed());
    group.run(CheckpointKind::Exit, &mut rig.coordinator).unwrap();
}

#[test]
fn workers_can_not_join_after_seal() {
    let mut rig = Rig::new(0);
    let group = rig.group("seal", &EngineOptions::new());
    let late = rig.device.open_queue(9);
    let late = Participant::new(9, replay_rs::device::CommandQueue::vas(&late));

    group.add_worker(late).unwrap();
    let err = group.add_worker(late).unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::DuplicateParticipant { context: 9, .. })
    ));

    // The coordinator now disagrees on the participant count.
    let err = group
        .run(CheckpointKind::Enter, &mut rig.coordinator)
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::ParticipantCountMismatch {
            expected: 1,
            actual: 2,
            ..
        })
    ));

    let mut rig = Rig::new(0);
    let group = rig.group("sealed", &EngineOptions::new());
    group.run(CheckpointKind::Enter, &mut rig.coordinator).unwrap();
    let err = group.add_worker(late).unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::ParticipantAfterSeal { context: 9, .. })
    ));
}

#[test]
fn phases_are_enforced() {
    let mut rig = Rig::new(0);
    let group = rig.group("phase", &EngineOptions::new());

    let err = group
        .run(CheckpointKind::Exit, &mut rig.coordinator)
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::PhaseViolation { action: "exit", .. })
    ));

    group.run(CheckpointKind::Enter, &mut rig.coordinator).unwrap();
    let err = group
        .run(CheckpointKind::Enter, &mut rig.coordinator)
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::PhaseViolation { action: "enter", .. })
    ));

    // Caller mistakes do not abort the group.
    assert!(!group.is_aborted());
    group.run(CheckpointKind::Exit, &mut rig.coordinator).unwrap();
}

#[test]
fn roles_are_cross_checked() {
    let mut rig = Rig::new(1);
    let group = rig.group("roles", &EngineOptions::new());

    rig.workers[0].coordinator = true;
    let err = group
        .run(CheckpointKind::Enter, &mut rig.workers[0])
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::RoleMismatch {
            context: 1,
            claims_coordinator: true,
            ..
        })
    ));

    let mut stranger = rig.device.open_context(5, false, 2);
    let err = group
        .run(CheckpointKind::Enter, &mut stranger)
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::UnknownParticipant { context: 5, .. })
    ));
}

#[test]
fn builder_rejects_bad_groups() {
    let mut rig = Rig::new(1);

    let err = CheckpointGroup::builder("headless", rig.pool.clone(), rig.rendezvous.clone())
        .worker(Participant::of(&mut rig.workers[0]))
        .build()
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::MissingCoordinator { .. })
    ));

    let worker = Participant::of(&mut rig.workers[0]);
    let err = CheckpointGroup::builder("twice", rig.pool.clone(), rig.rendezvous.clone())
        .coordinator(Participant::of(&mut rig.coordinator))
        .worker(worker)
        .worker(worker)
        .build()
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::DuplicateParticipant { context: 1, .. })
    ));

    assert!(rig.pool.active_slots().is_empty());
}

#[test]
fn dropping_the_group_releases_its_slots() {
    let mut rig = Rig::new(1);
    let group = rig.group("drop", &EngineOptions::new());
    assert_eq!(rig.pool.active_slots().len(), 2);

    rig.run(&group);
    drop(group);

    assert!(rig.pool.active_slots().is_empty());
    assert_eq!(rig.device.live_allocations(), 0);
    assert_eq!(rig.device.live_mappings(), 0);
}

#[test]
fn abort_wakes_waiting_participants() {
    let mut rig = Rig::new(1);
    let group = rig.group("abort", &EngineOptions::new());

    let err = std::thread::scope(|s| {
        let waiter = {
            let group = group.clone();
            let ctx = &mut rig.workers[0];
            s.spawn(move || group.run(CheckpointKind::Enter, ctx))
        };

        std::thread::sleep(Duration::from_millis(20));
        group.abort(&ReplayError::Aborted {
            checkpoint: "abort".to_string(),
        });
        waiter.join().unwrap().unwrap_err()
    });

    assert!(matches!(err, ReplayError::Aborted { .. }));
    assert!(group.is_aborted());

    let err = group
        .run(CheckpointKind::Enter, &mut rig.coordinator)
        .unwrap_err();
    assert!(matches!(err, ReplayError::Aborted { .. }));
}

#[test]
fn aborted_name_can_be_reused() {
    let mut rig = Rig::new(0);
    let group = rig.group("reused", &EngineOptions::new());
    group.abort(&ReplayError::Aborted {
        checkpoint: "reused".to_string(),
    });
    assert!(rig.rendezvous.is_known("reused:enter"));
    drop(group);
    assert!(!rig.rendezvous.is_known("reused:enter"));
    assert!(!rig.rendezvous.is_known("reused:exit"));

    let group = rig.group("reused", &EngineOptions::new());
    group.run(CheckpointKind::Enter, &mut rig.coordinator).unwrap();
    group.run(CheckpointKind::Exit, &mut rig.coordinator).unwrap();
    assert!(!group.is_aborted());
}

#[test]
fn unusable_release_steps_are_rejected() {
    let mut rig = Rig::new(2);
    let coordinator = Participant::of(&mut rig.coordinator);
    let workers: Vec<_> = rig
        .workers
        .iter_mut()
        .map(|ctx| Participant::of(ctx))
        .collect();

    let err = CheckpointGroup::builder("zero", rig.pool.clone(), rig.rendezvous.clone())
        .coordinator(coordinator)
        .step(0)
        .build()
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::InvalidStep {
            step: 0,
            workers: 0,
            ..
        })
    ));

    let err = CheckpointGroup::builder("wide", rig.pool.clone(), rig.rendezvous.clone())
        .coordinator(coordinator)
        .workers(workers.clone())
        .step(0x8000_0000)
        .build()
        .unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::InvalidStep {
            step: 0x8000_0000,
            workers: 2,
            ..
        })
    ));
    assert!(rig.pool.active_slots().is_empty());

    // One worker still fits in the exit target, a second one does not.
    let group = CheckpointGroup::builder("grow", rig.pool.clone(), rig.rendezvous.clone())
        .coordinator(coordinator)
        .worker(workers[0])
        .step(0x8000_0000)
        .build()
        .unwrap();
    let err = group.add_worker(workers[1]).unwrap_err();
    assert!(matches!(
        err.invariant(),
        Some(InvariantError::InvalidStep { workers: 2, .. })
    ));
    assert_eq!(group.participant_count(), 2);
}

#[test]
fn device_rejection_on_a_worker_aborts_the_group() {
    let mut rig = Rig::new(1);
    let group = rig.group("rejected", &EngineOptions::new());
    // The coordinator injects nothing before every worker has signalled, so
    // the fault lands on the worker's acquire.
    rig.device.fail_next(Fault::Inject);

    let (coordinator, worker) = std::thread::scope(|s| {
        let coordinator = {
            let group = group.clone();
            let ctx = &mut rig.coordinator;
            s.spawn(move || group.run(CheckpointKind::Enter, ctx))
        };
        let worker = {
            let group = group.clone();
            let ctx = &mut rig.workers[0];
            s.spawn(move || group.run(CheckpointKind::Enter, ctx))
        };
        (coordinator.join().unwrap(), worker.join().unwrap())
    });

    match worker.unwrap_err() {
        ReplayError::Device(DeviceError::Rejected { method, .. }) => {
            assert_eq!(method, Method::SemaphoreAcquire as u32);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(matches!(
        coordinator.unwrap_err(),
        ReplayError::Aborted { .. }
    ));
    assert!(group.is_aborted());
}

#[test]
fn first_arrival_seals_the_group() {
    let mut rig = Rig::new(1);
    let group = rig.group("early", &EngineOptions::new());
    let late = rig.device.open_queue(9);
    let late = Participant::new(9, replay_rs::device::CommandQueue::vas(&late));

    std::thread::scope(|s| {
        let worker = {
            let group = group.clone();
            let ctx = &mut rig.workers[0];
            s.spawn(move || -> replay_rs::Result<()> {
                group.run(CheckpointKind::Enter, &mut *ctx)?;
                group.run(CheckpointKind::Exit, &mut *ctx)
            })
        };

        // The worker is parked at the rendezvous by now.
        std::thread::sleep(Duration::from_millis(20));
        assert!(group.is_sealed());
        let err = group.add_worker(late).unwrap_err();
        assert!(matches!(
            err.invariant(),
            Some(InvariantError::ParticipantAfterSeal { context: 9, .. })
        ));

        group.run(CheckpointKind::Enter, &mut rig.coordinator).unwrap();
        group.run(CheckpointKind::Exit, &mut rig.coordinator).unwrap();
        worker.join().unwrap().unwrap();
    });

    assert_eq!(group.participant_count(), 2);
}
