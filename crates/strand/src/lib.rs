//! # strand - cooperative fibers with blocking-style I/O
//!
//! Code written against ordinary blocking calls (`read`, `connect`,
//! `sleep`, ...) runs on a small pool of OS threads. Whenever a call would
//! block, the fiber making it is parked and the thread moves on to other
//! work; the fiber resumes when its descriptor is ready or its timer fires.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{Runtime, SchedulerConfig, spawn, sleep};
//! use std::time::Duration;
//!
//! fn main() -> strand::RuntimeResult<()> {
//!     strand::init_logging();
//!     let rt = Runtime::new(SchedulerConfig::from_env().threads(2))?;
//!     rt.block_on(|| {
//!         spawn(|| {
//!             sleep(Duration::from_millis(10)); // parks the fiber only
//!             println!("woke up");
//!         });
//!     });
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │          spawn(), yield_now(), sleep(), hook::*             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              IoManager = Scheduler + Reactor                │
//! │       FIFO task queue, thread affinity, epoll idle          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Timers   │
//!    │  Thread   │      │  Thread   │      │ (deadline)│
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   Fibers: mmap stacks with guard page, asm switch       │
//!    └─────────────────────────────────────────────────────────┘
//! ```

mod logging;

pub use logging::init_logging;

// Re-export core types
pub use strand_core::{
    ConfigError,
    Event,
    FiberId,
    FiberState,
    RuntimeError,
    RuntimeResult,
    StackError,
};

// Re-export env utilities
pub use strand_core::{env_flag, env_get, env_millis, env_opt};

// Re-export runtime types
pub use strand_runtime::{
    Callback,
    Driver,
    Fiber,
    FiberRef,
    ParkingDriver,
    Scheduler,
    SchedulerConfig,
    Task,
    Thread,
    Tid,
    Timer,
    TimerCallback,
    TimerManager,
};

// Re-export I/O types
pub use strand_io::{hook, FdRegistry, IoManager, Reactor, ReactorConfig};

use std::sync::Arc;
use std::time::Duration;

/// A started [`IoManager`] with an application-facing API.
///
/// With `use_caller` (the default) the thread creating the runtime joins
/// the worker pool while [`shutdown`](Self::shutdown) drains the queue, so
/// it must also be the thread that shuts it down.
pub struct Runtime {
    iom: IoManager,
}

impl Runtime {
    /// Start a runtime; reactor settings come from the environment.
    pub fn new(config: SchedulerConfig) -> RuntimeResult<Self> {
        Self::with_reactor(config, ReactorConfig::from_env())
    }

    pub fn with_reactor(config: SchedulerConfig, reactor: ReactorConfig) -> RuntimeResult<Self> {
        Ok(Runtime { iom: IoManager::with_config(config, reactor)? })
    }

    /// Run `f` on the calling thread, then shut down.
    ///
    /// Everything `f` spawned has finished when this returns.
    pub fn block_on<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let result = f();
        self.shutdown();
        result
    }

    /// Queue `f` as a new task. Tasks queued after shutdown never run.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule(f);
    }

    /// Arm a timer on the runtime's reactor.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.iom.add_timer(ms, cb, recurring)
    }

    #[inline]
    pub fn io_manager(&self) -> &IoManager {
        &self.iom
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.iom.scheduler()
    }

    /// Wait for queued tasks and pending I/O, then join the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.iom.stop();
    }
}

/// Queue `f` on the scheduler the calling thread belongs to.
///
/// # Panics
///
/// If the calling thread is not part of a runtime.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match Scheduler::current() {
        Some(sched) => sched.schedule(f),
        None => panic!("strand::spawn() called outside a runtime thread"),
    }
}

/// Give other tasks a turn.
///
/// Inside a task the fiber goes to the back of the queue. Elsewhere this
/// yields the OS thread.
pub fn yield_now() {
    if let (Some(sched), true) = (Scheduler::current(), in_fiber()) {
        sched.schedule_fiber(Fiber::current());
        Fiber::yield_current();
    } else {
        std::thread::yield_now();
    }
}

/// Sleep without blocking the worker when called from a task; a plain
/// thread sleep otherwise.
pub fn sleep(duration: Duration) {
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if !hook::fiber_sleep(ms) {
        std::thread::sleep(duration);
    }
}

/// Id of the fiber running on this thread, if one was ever created.
#[inline]
pub fn current_id() -> Option<FiberId> {
    Fiber::current_id()
}

/// Whether the caller runs in a task fiber (not a thread's main fiber).
pub fn in_fiber() -> bool {
    current_id().is_some() && !Fiber::current().is_main()
}
