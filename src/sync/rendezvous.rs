use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard},
};

use crate::error::{ReplayError, Result};

/// "Wait until every registered participant has called this", keyed by name.
pub trait Rendezvous: Send + Sync {
    fn arrive(&self, key: &str, participants: usize) -> Result<()>;

    /// Fail every current and future arrival at `key`.
    fn abort(&self, key: &str);

    /// Drop all state kept for `key`, abort included. Anyone still waiting
    /// fails with `Aborted`.
    fn forget(&self, key: &str);
}

#[derive(Default)]
struct Meeting {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Generation counting rendezvous for participants living in one process.
#[derive(Default)]
pub struct HostRendezvous {
    meetings: Mutex<HashMap<String, Meeting>>,
    changed: Condvar,
}

impl HostRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Meeting>> {
        self.meetings.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("rendezvous lock is poisoned!");
            poisoned.into_inner()
        })
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn generation(&self, key: &str) -> u64 {
        self.lock().get(key).map(|m| m.generation).unwrap_or(0)
    }
}

impl Rendezvous for HostRendezvous {
    fn arrive(&self, key: &str, participants: usize) -> Result<()> {
        let aborted = || ReplayError::Aborted {
            checkpoint: key.to_string(),
        };

        let mut meetings = self.lock();
        let meeting = meetings.entry(key.to_string()).or_default();
        if meeting.aborted {
            return Err(aborted());
        }

        meeting.arrived += 1;
        let generation = meeting.generation;
        tracing::trace!(
            "rendezvous {key}: {}/{participants} arrived",
            meeting.arrived
        );

        if meeting.arrived >= participants {
            meeting.arrived = 0;
            meeting.generation += 1;
            drop(meetings);
            self.changed.notify_all();
            return Ok(());
        }

        loop {
            meetings = self.changed.wait(meetings).unwrap_or_else(|poisoned| {
                tracing::warn!("rendezvous lock is poisoned!");
                poisoned.into_inner()
            });

            match meetings.get(key) {
                Some(meeting) if meeting.aborted => return Err(aborted()),
                Some(meeting) if meeting.generation != generation => return Ok(()),
                Some(_) => {}
                None => return Err(aborted()),
            }
        }
    }

    fn abort(&self, key: &str) {
        self.lock().entry(key.to_string()).or_default().aborted = true;
        self.changed.notify_all();
    }

    fn forget(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            tracing::trace!("rendezvous {key}: forgotten");
        }
        self.changed.notify_all();
    }
}
