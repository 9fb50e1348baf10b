//! Scheduler configuration
//!
//! Compile-time defaults (see `defaults`) with runtime environment overrides.
//!
//! # Priority (highest wins)
//!
//! 1. Builder calls
//! 2. `STRAND_*` environment variables (`from_env`)
//! 3. `STRAND_CONFIG_RS` file merged at build time
//! 4. Library defaults
//!
//! ```rust,ignore
//! use strand_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .threads(4)
//!     .use_caller(false)
//!     .name("io");
//! ```

pub mod defaults;

use std::time::Duration;
use strand_core::constants::MIN_STACK_SIZE;
use strand_core::env::{env_flag, env_get, env_millis};
use strand_core::ConfigError;

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler name, also the prefix of worker thread names
    pub name: String,
    /// Total threads, including the caller when `use_caller` is set
    pub threads: usize,
    /// Whether the constructing thread participates in scheduling
    pub use_caller: bool,
    /// Stack size for fibers the scheduler creates
    pub stack_size: usize,
    /// Enable syscall interception on worker threads
    pub hook_enabled: bool,
    /// Upper bound for one park of the base idle loop
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// - `STRAND_THREADS`
    /// - `STRAND_USE_CALLER` (0/1)
    /// - `STRAND_STACK_SIZE`
    /// - `STRAND_HOOK_ENABLE` (0/1)
    /// - `STRAND_IDLE_PARK_MS`
    pub fn from_env() -> Self {
        Self {
            name: String::from("main"),
            threads: env_get("STRAND_THREADS", defaults::WORKER_THREADS),
            use_caller: env_flag("STRAND_USE_CALLER", defaults::USE_CALLER),
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            hook_enabled: env_flag("STRAND_HOOK_ENABLE", defaults::HOOK_ENABLE),
            idle_park: env_millis("STRAND_IDLE_PARK_MS", defaults::IDLE_PARK_MS),
        }
    }

    /// Compile-time defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            name: String::from("main"),
            threads: defaults::WORKER_THREADS,
            use_caller: defaults::USE_CALLER,
            stack_size: defaults::STACK_SIZE,
            hook_enabled: defaults::HOOK_ENABLE,
            idle_park: Duration::from_millis(defaults::IDLE_PARK_MS),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, enabled: bool) -> Self {
        self.use_caller = enabled;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn hook_enabled(mut self, enabled: bool) -> Self {
        self.hook_enabled = enabled;
        self
    }

    pub fn idle_park(mut self, d: Duration) -> Self {
        self.idle_park = d;
        self
    }

    /// Number of OS threads `start()` has to spawn.
    pub fn spawned_threads(&self) -> usize {
        if self.use_caller {
            self.threads - 1
        } else {
            self.threads
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.stack_size, MIN_STACK_SIZE));
        }
        if self.idle_park.is_zero() {
            return Err(ConfigError::Zero("idle_park"));
        }
        Ok(())
    }
}
