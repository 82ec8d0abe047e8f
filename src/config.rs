use std::time::Duration;

use crate::sync::checkpoint::{DEFAULT_IDLE_TIMEOUT, DEFAULT_RELEASE_STEP};

pub const ENFORCE_DEPS_VAR: &str = "REPLAY_ENFORCE_DEPS";
pub const POLL_INTERVAL_VAR: &str = "REPLAY_POLL_INTERVAL_US";
pub const TIMEOUT_VAR: &str = "REPLAY_TIMEOUT_MS";
pub const GLOBAL_TIMEOUT_VAR: &str = "REPLAY_GLOBAL_TIMEOUT_MS";

/// Knobs shared by the graph, the driver and checkpoint groups.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// When off, operations run in id order and pollable ones block.
    pub enforce_dependencies: bool,
    /// Sleep between drive passes that made no progress.
    pub poll_interval: Duration,
    /// Applied to pollable operations that do not carry their own timeout.
    /// `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Bound on a whole `run_to_completion`.
    pub global_timeout: Option<Duration>,
    pub release_step: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            enforce_dependencies: true,
            poll_interval: Duration::from_millis(1),
            default_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            global_timeout: None,
            release_step: DEFAULT_RELEASE_STEP,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by whatever `REPLAY_*` variables are set. Values
    /// that do not parse are ignored.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(mut self) -> Self {
        if let Some(enforce) = read_var(ENFORCE_DEPS_VAR, parse_bool) {
            self.enforce_dependencies = enforce;
        }
        if let Some(us) = read_var(POLL_INTERVAL_VAR, |v| v.parse::<u64>().ok()) {
            self.poll_interval = Duration::from_micros(us);
        }
        if let Some(ms) = read_var(TIMEOUT_VAR, |v| v.parse::<u64>().ok()) {
            self.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = read_var(GLOBAL_TIMEOUT_VAR, |v| v.parse::<u64>().ok()) {
            self.global_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        self
    }

    pub fn enforce_dependencies(mut self, enforce: bool) -> Self {
        self.enforce_dependencies = enforce;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn global_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn release_step(mut self, step: u32) -> Self {
        self.release_step = step;
        self
    }

    /// Timeout for one operation: its own if it has one, else the default.
    /// No timeout at all comes back as `Duration::MAX`.
    pub fn effective_timeout(&self, own: Option<Duration>) -> Duration {
        own.or(self.default_timeout).unwrap_or(Duration::MAX)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_var<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let value = std::env::var(name).ok()?;
    let parsed = parse(value.trim());
    if parsed.is_none() {
        tracing::warn!("ignoring malformed {name}={value:?}");
    }
    parsed
}
