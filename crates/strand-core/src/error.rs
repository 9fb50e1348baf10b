//! Error types for the strand runtime

use std::io;
use thiserror::Error;

/// Result type for runtime construction and lifecycle operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by runtime constructors and lifecycle calls.
///
/// Misuse of the fiber or reactor API (double registration, resuming a
/// finished fiber) is not represented here; those are bugs and panic.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Fiber stack could not be mapped
    #[error("stack allocation failed: {0}")]
    Stack(#[from] StackError),

    /// OS refused to create a worker thread
    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Worker thread panicked before it could be joined
    #[error("thread `{0}` panicked")]
    ThreadPanicked(String),

    /// `start()` called twice
    #[error("scheduler `{0}` already started")]
    AlreadyStarted(String),

    /// epoll or wake-up pipe setup failed
    #[error("reactor setup failed: {0}")]
    Reactor(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Stack mapping errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// mmap failed
    #[error("mapping {size} bytes failed (errno {errno})")]
    MapFailed { size: usize, errno: i32 },

    /// mprotect on the guard page failed
    #[error("guard page protection failed (errno {0})")]
    GuardFailed(i32),

    /// Requested size overflowed after page rounding
    #[error("stack size {0} too large")]
    TooLarge(usize),
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    NoThreads,

    #[error("stack size {0} is below the minimum of {1} bytes")]
    StackTooSmall(usize, usize),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}
