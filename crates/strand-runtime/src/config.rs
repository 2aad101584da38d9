//! Runtime configuration
//!
//! Compile-time defaults with `STRAND_*` environment overrides.
//!
//! ```ignore
//! use strand_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//! ```

use strand_core::env::{env_get, env_get_bool};

pub mod defaults {
    /// Fiber stack size in bytes
    pub const STACK_SIZE: usize = 128 * 1024;
    /// Upper bound on one poller wait, milliseconds
    pub const MAX_POLL_TIMEOUT_MS: u64 = 5000;
    /// Events drained per poller wait
    pub const MAX_POLL_EVENTS: usize = 256;
    /// Initial fd-context table capacity
    pub const FD_TABLE_CAPACITY: usize = 64;
    /// Enable the syscall hooks on reactor workers
    pub const HOOK_WORKERS: bool = true;
    /// Default connect() deadline; max value means no deadline
    pub const CONNECT_TIMEOUT_MS: u64 = u64::MAX;
}

/// Runtime configuration shared by the scheduler and the reactor
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for worker fibers
    pub stack_size: usize,
    /// Cap on a single poller wait
    pub max_poll_timeout_ms: u64,
    /// Poller event batch size
    pub max_poll_events: usize,
    /// Initial capacity of the reactor fd-context table
    pub fd_table_capacity: usize,
    /// Turn the hook switch on for every reactor worker thread
    pub hook_workers: bool,
    /// Deadline applied by hooked connect(); `u64::MAX` = none
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    ///
    /// Environment variables (all optional):
    /// - `STRAND_STACK_SIZE` - fiber stack size in bytes
    /// - `STRAND_MAX_POLL_TIMEOUT_MS` - poller wait cap
    /// - `STRAND_MAX_POLL_EVENTS` - poller batch size
    /// - `STRAND_FD_TABLE_CAPACITY` - initial fd table size
    /// - `STRAND_HOOK_WORKERS` - enable hooks on workers (0/1)
    /// - `STRAND_CONNECT_TIMEOUT_MS` - hooked connect() deadline
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            max_poll_timeout_ms: env_get("STRAND_MAX_POLL_TIMEOUT_MS", defaults::MAX_POLL_TIMEOUT_MS),
            max_poll_events: env_get("STRAND_MAX_POLL_EVENTS", defaults::MAX_POLL_EVENTS),
            fd_table_capacity: env_get("STRAND_FD_TABLE_CAPACITY", defaults::FD_TABLE_CAPACITY),
            hook_workers: env_get_bool("STRAND_HOOK_WORKERS", defaults::HOOK_WORKERS),
            connect_timeout_ms: env_get("STRAND_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
        }
    }

    /// Plain defaults, no environment override
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            max_poll_timeout_ms: defaults::MAX_POLL_TIMEOUT_MS,
            max_poll_events: defaults::MAX_POLL_EVENTS,
            fd_table_capacity: defaults::FD_TABLE_CAPACITY,
            hook_workers: defaults::HOOK_WORKERS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::new();
        assert_eq!(c.stack_size, 128 * 1024);
        assert_eq!(c.max_poll_timeout_ms, 5000);
        assert_eq!(c.max_poll_events, 256);
        assert_eq!(c.fd_table_capacity, 64);
        assert!(c.hook_workers);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("STRAND_STACK_SIZE", "65536");
        let c = RuntimeConfig::from_env();
        assert_eq!(c.stack_size, 65536);
        std::env::remove_var("STRAND_STACK_SIZE");
    }
}
