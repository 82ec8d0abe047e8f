//! Leaf checks for pollable operations.
//!
//! With dependency enforcement on, the driver is invoked over and over by its
//! caller, so a leaf looks at its condition once and reports `Pending`. With
//! enforcement off nothing will call back, so the leaf blocks here with its
//! own timeout instead.

use std::time::{Duration, Instant};

use crate::{
    device::DeviceError,
    error::{ReplayError, Result},
};

use super::{
    driver::DriveEnv,
    op::{OpId, Progress},
};

fn timed_out(op: OpId, condition: &str, timeout: Duration) -> ReplayError {
    ReplayError::Timeout {
        op,
        condition: condition.to_string(),
        timeout,
    }
}

/// Single inspection. `started` is the first time this operation was checked.
pub fn check(
    op: OpId,
    condition: &str,
    started: Instant,
    timeout: Duration,
    holds: bool,
) -> Result<Progress> {
    if holds {
        return Ok(Progress::Done);
    }

    if started.elapsed() >= timeout {
        tracing::debug!("#{op}: gave up on {condition} after {timeout:?}");
        return Err(timed_out(op, condition, timeout));
    }

    Ok(Progress::Pending)
}

pub fn block_until(
    op: OpId,
    condition: &str,
    timeout: Duration,
    interval: Duration,
    mut holds: impl FnMut() -> Result<bool>,
) -> Result<Progress> {
    let started = Instant::now();

    loop {
        if holds()? {
            return Ok(Progress::Done);
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            tracing::debug!("#{op}: gave up on {condition} after {timeout:?}");
            return Err(timed_out(op, condition, timeout));
        }

        std::thread::sleep(interval.min(timeout - elapsed));
    }
}

pub fn block_until_idle(op: OpId, env: &mut DriveEnv<'_>, timeout: Duration) -> Result<Progress> {
    match env.queue().wait_for_local_idle(timeout) {
        Ok(()) => Ok(Progress::Done),
        Err(DeviceError::IdleTimeout(timeout)) => Err(timed_out(op, "channel idle", timeout)),
        Err(err) => Err(err.into()),
    }
}
