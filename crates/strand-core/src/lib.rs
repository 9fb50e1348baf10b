//! # strand-core
//!
//! Core types for the strand fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stacks, scheduling and the epoll reactor live in
//! `strand-runtime` and `strand-io`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier and allocator
//! - `state` - Fiber lifecycle state and I/O event interest
//! - `error` - Error types shared by the runtime crates
//! - `env` - Environment variable utilities for configuration overrides

pub mod env;
pub mod error;
pub mod id;
pub mod state;

// Re-exports for convenience
pub use env::{env_flag, env_get, env_millis, env_opt};
pub use error::{ConfigError, RuntimeError, RuntimeResult, StackError};
pub use id::FiberId;
pub use state::{Event, FiberState};

/// Runtime-wide constants that are not tunable through configuration.
pub mod constants {
    /// Smallest stack a fiber may be given, before page rounding.
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Sentinel returned by `next_timer_ms` when no timer is armed.
    pub const NO_TIMER: u64 = u64::MAX;

    /// Sentinel for "no timeout" on a descriptor direction.
    pub const NO_TIMEOUT: u64 = u64::MAX;
}
