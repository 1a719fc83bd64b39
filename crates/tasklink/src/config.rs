//! Dispatcher configuration.
//!
//! Defaults come from the environment so a deployed client can be tuned
//! without a rebuild:
//! - `TASKLINK_READY_POLL_MS`: delay between readiness checks (default 50)
//! - `TASKLINK_REBIND_MS`: minimum gap between bind attempts (default 1000)
//! - `TASKLINK_TIMEOUT_MS`: timeout for `TaskHandle::wait_default` (default 30000)

use std::time::Duration;

const DEFAULT_READY_POLL_MS: u64 = 50;
const DEFAULT_REBIND_MS: u64 = 1_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long the worker waits before re-checking transport readiness
    /// while the head of the queue is deferred.
    pub ready_poll_interval: Duration,
    /// Minimum time between two `bind` triggers while the transport is unlinked.
    pub rebind_interval: Duration,
    /// Timeout applied by `TaskHandle::wait_default`.
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval: env_millis("TASKLINK_READY_POLL_MS", DEFAULT_READY_POLL_MS),
            rebind_interval: env_millis("TASKLINK_REBIND_MS", DEFAULT_REBIND_MS),
            default_timeout: env_millis("TASKLINK_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    pub fn with_rebind_interval(mut self, interval: Duration) -> Self {
        self.rebind_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    parse_millis(std::env::var(name).ok().as_deref(), default_ms)
}

fn parse_millis(raw: Option<&str>, default_ms: u64) -> Duration {
    let ms = raw
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
