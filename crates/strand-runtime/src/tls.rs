//! Thread-local runtime slots
//!
//! Each OS thread tracks which fiber is running on it, the thread's
//! implicit main fiber, the fiber that acts as scheduler loop, the
//! scheduler it belongs to and whether syscall interception is on.
//!
//! A fiber can be resumed on a different thread than the one it last ran
//! on. Accessors are `#[inline(never)]` so a thread-local address computed
//! before a switch is never reused after it.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber executing on this thread; null until first use.
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// Owning handle of the thread's main fiber.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber that runs the scheduler loop on this thread.
    static SCHEDULING_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Fiber currently running on this thread (may be null).
#[inline(never)]
pub fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

/// Main fiber of this thread, if it was created.
#[inline(never)]
pub fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|f| f.borrow().clone())
}

#[inline(never)]
pub fn set_thread_fiber(fiber: Arc<Fiber>) {
    THREAD_FIBER.with(|f| *f.borrow_mut() = Some(fiber));
}

#[inline(never)]
pub fn scheduling_fiber() -> *const Fiber {
    SCHEDULING_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_scheduling_fiber(fiber: *const Fiber) {
    SCHEDULING_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

/// True when this thread is bound to `sched`.
#[inline(never)]
pub fn is_scheduler(sched: &Scheduler) -> bool {
    SCHEDULER.with(|s| {
        s.borrow()
            .as_ref()
            .is_some_and(|w| ptr::eq(w.as_ptr(), sched as *const Scheduler))
    })
}

#[inline(never)]
pub fn set_scheduler(sched: Option<Weak<Scheduler>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

/// Whether syscall interception is active on this thread.
#[inline(never)]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline(never)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

/// Drop every slot that refers to `main`, the thread's main fiber.
///
/// Runs while thread-locals are being torn down, so every access is
/// fallible.
pub(crate) fn release_thread(main: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|c| {
        if c.get() == main {
            c.set(ptr::null());
        }
    });
    let _ = SCHEDULING_FIBER.try_with(|c| {
        if c.get() == main {
            c.set(ptr::null());
        }
    });
    let _ = SCHEDULER.try_with(|s| {
        if let Ok(mut s) = s.try_borrow_mut() {
            *s = None;
        }
    });
    let _ = HOOK_ENABLED.try_with(|c| c.set(false));
}
