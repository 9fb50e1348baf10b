//! # strand-runtime
//!
//! Fibers and the machinery that runs them:
//!
//! - `arch` - hand-written context switch for x86_64 and aarch64
//! - `stack` - guarded mmap stacks
//! - `fiber` - stackful coroutines with resume/yield
//! - `thread` - named OS threads reporting their kernel id
//! - `scheduler` - N:M cooperative scheduler with pluggable idle driver
//! - `parking` - futex/condvar parking for the base idle driver
//! - `timer` - ordered deadline timers
//! - `config` - compile-time defaults plus `STRAND_*` overrides
//! - `tls` - per-thread runtime slots
//!
//! The epoll reactor and syscall hooks build on this in `strand-io`.

pub mod arch;
pub mod config;
pub mod fiber;
pub mod parking;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

pub use config::SchedulerConfig;
pub use fiber::{Callback, Fiber, FiberRef};
pub use scheduler::{Driver, ParkingDriver, Schedulable, Scheduler, Task};
pub use thread::{Thread, Tid};
pub use timer::{Timer, TimerCallback, TimerManager, TimerObserver};

// Re-export core types so dependents need only one import path.
pub use strand_core::{Event, FiberId, FiberState, RuntimeError, RuntimeResult};
