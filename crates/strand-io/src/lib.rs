//! # strand-io
//!
//! Blocking-style I/O for strand fibers.
//!
//! - `reactor` - [`IoManager`]: a scheduler whose idle workers wait in epoll,
//!   plus the timers they wake up for
//! - `fd` - per-descriptor state (socket?, non-blocking mode, timeouts)
//! - `syscall` - the original libc entry points, resolved with `dlsym`
//! - `hook` - libc-compatible calls that suspend the fiber instead of the
//!   thread
//! - `interpose` (feature) - exports the hooks under the libc symbol names
//!
//! ```ignore
//! use strand_io::{hook, IoManager};
//!
//! let iom = IoManager::new(2, false, "io")?;
//! iom.schedule(|| unsafe {
//!     hook::usleep(100_000); // parks the fiber, not the worker
//! });
//! iom.stop();
//! ```

pub mod fd;
pub mod hook;
pub mod reactor;
pub mod syscall;

#[cfg(feature = "interpose")]
pub mod interpose;

pub use fd::{FdContext, FdRegistry, TimeoutKind};
pub use hook::{is_hook_enabled, set_hook_enabled};
pub use reactor::{IoManager, Reactor, ReactorConfig};
