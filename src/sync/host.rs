use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct Count {
    value: u64,
    poisoned: bool,
}

/// Counting wait primitive. Only checkpoint coordinators block on it.
#[derive(Default)]
pub struct HostSemaphore {
    count: Mutex<Count>,
    signaled: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("host semaphore was poisoned")]
pub struct Poisoned;

impl HostSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Count> {
        self.count.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("host semaphore lock is poisoned!");
            poisoned.into_inner()
        })
    }

    pub fn signal(&self) {
        let mut count = self.lock();
        count.value += 1;
        drop(count);
        self.signaled.notify_all();
    }

    /// Block until `n` signals have been consumed.
    pub fn wait_many(&self, n: u64) -> Result<(), Poisoned> {
        let mut count = self.lock();
        let mut remaining = n;

        while remaining > 0 {
            if count.poisoned {
                return Err(Poisoned);
            }

            if count.value > 0 {
                let take = count.value.min(remaining);
                count.value -= take;
                remaining -= take;
                continue;
            }

            count = self.signaled.wait(count).unwrap_or_else(|poisoned| {
                tracing::warn!("host semaphore lock is poisoned!");
                poisoned.into_inner()
            });
        }

        Ok(())
    }

    pub fn wait(&self) -> Result<(), Poisoned> {
        self.wait_many(1)
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.lock();
        if count.poisoned || count.value == 0 {
            return false;
        }
        count.value -= 1;
        true
    }

    /// Wake every waiter with an error. Sticky.
    pub fn poison(&self) {
        self.lock().poisoned = true;
        self.signaled.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned
    }

    pub fn available(&self) -> u64 {
        self.lock().value
    }
}
