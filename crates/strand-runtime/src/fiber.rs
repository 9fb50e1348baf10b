//! Stackful coroutines
//!
//! A [`Fiber`] owns an mmap'd stack and a saved register file. Control moves
//! only through [`Fiber::resume`] and [`Fiber::yield_now`]: `resume` records
//! the running fiber as the one to return to and switches in, `yield_now`
//! switches back to it.
//!
//! ```text
//!            resume()                 closure returns
//!   READY ─────────────▶ RUNNING ──────────────────────▶ TERM
//!     ▲                     │                              │
//!     └──── yield_now() ────┘          reset(f) ───────────┘ (back to READY)
//! ```
//!
//! Every thread also has an implicit main fiber, created on first use of
//! [`Fiber::current`]. It has no stack, is always RUNNING and is the
//! bottom of that thread's switch chain.
//!
//! A fiber may be handed to another thread while it is still switching out
//! (a reactor thread can fire its event before the yield completes).
//! `in_flight` is held from `resume` until the switch back has saved the
//! context, and a competing `resume` waits for it.

use crate::arch::{self, Context};
use crate::config::defaults;
use crate::stack::Stack;
use crate::tls;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_core::{FiberId, FiberState, RuntimeResult};
use tracing::{debug, error, trace, warn};

/// Closure type carried by fibers and scheduler tasks.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to a fiber.
pub type FiberRef = Arc<Fiber>;

static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

/// A stackful coroutine.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    run_in_scheduler: bool,
    /// `None` for a thread's main fiber
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    callback: Mutex<Option<Callback>>,
    /// Fiber that resumed us; `yield_now` switches back to it.
    link: AtomicPtr<Fiber>,
    in_flight: AtomicBool,
}

// `ctx` is only touched by the thread that owns the `in_flight` claim, or
// by the fiber itself while it runs.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a READY fiber that will run `f` on its own stack.
    ///
    /// `stack_size == 0` selects the configured default. With
    /// `run_in_scheduler` the fiber is meant to be resumed by a scheduler's
    /// loop fiber; otherwise by the thread's main fiber.
    ///
    /// # Panics
    ///
    /// If the stack cannot be mapped. Use [`Fiber::try_new`] to handle that.
    pub fn new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_callback(Box::new(f), stack_size, run_in_scheduler)
    }

    pub fn try_new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> RuntimeResult<FiberRef>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), stack_size, run_in_scheduler)
    }

    pub(crate) fn from_callback(cb: Callback, stack_size: usize, run_in_scheduler: bool) -> FiberRef {
        match Self::build(cb, stack_size, run_in_scheduler) {
            Ok(fiber) => fiber,
            Err(e) => {
                error!(error = %e, "fiber creation failed");
                panic!("fiber creation failed: {}", e);
            }
        }
    }

    fn build(cb: Callback, stack_size: usize, run_in_scheduler: bool) -> RuntimeResult<FiberRef> {
        let size = if stack_size == 0 { defaults::STACK_SIZE } else { stack_size };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(Context::default()),
            callback: Mutex::new(Some(cb)),
            link: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicBool::new(false),
        });
        // The entry argument is the fiber's final heap address.
        unsafe { fiber.prepare_context() };

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        trace!(fiber = %fiber.id, size, "fiber created");
        Ok(fiber)
    }

    fn new_main() -> FiberRef {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(Context::default()),
            callback: Mutex::new(None),
            link: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicBool::new(false),
        });
        trace!(fiber = %fiber.id, "main fiber created");
        fiber
    }

    /// # Safety
    ///
    /// Nobody may be executing on this fiber's stack.
    unsafe fn prepare_context(&self) {
        if let Some(stack) = &self.stack {
            arch::init_context(&mut *self.ctx.get(), stack.top(), fiber_entry, self as *const Fiber as usize);
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// True for a thread's implicit main fiber.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Usable stack bytes, 0 for a main fiber.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Switch into this fiber until it yields or terminates.
    ///
    /// # Panics
    ///
    /// If the fiber is not READY, or is the fiber calling `resume`.
    pub fn resume(self: &Arc<Self>) {
        let back = Self::current_ptr();
        if ptr::eq(back, Arc::as_ptr(self)) {
            panic!("fiber {} resumed itself", self.id);
        }

        self.claim();
        let state = self.state();
        if state != FiberState::Ready {
            self.in_flight.store(false, Ordering::Release);
            error!(fiber = %self.id, %state, "resume of a fiber that is not READY");
            panic!("fiber {} resumed in state {}", self.id, state);
        }

        if self.run_in_scheduler {
            let sched = tls::scheduling_fiber();
            if !sched.is_null() && !ptr::eq(sched, back) {
                debug!(fiber = %self.id, "scheduler fiber resumed outside the scheduling loop");
            }
        }

        self.link.store(back as *mut Fiber, Ordering::Release);
        tls::set_current_fiber(Arc::as_ptr(self));
        self.set_state(FiberState::Running);
        trace!(fiber = %self.id, "resume");

        unsafe { arch::switch_context((*back).ctx.get(), self.ctx.get()) };

        // Back on the resumer's stack: our context is fully saved.
        self.in_flight.store(false, Ordering::Release);
    }

    /// Switch back to the fiber that resumed this one.
    ///
    /// Must be called by the running fiber itself. A RUNNING fiber becomes
    /// READY; a TERM fiber stays TERM.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Running | FiberState::Term),
            "fiber {} yielded in state {}",
            self.id,
            state
        );
        let back = self.link.load(Ordering::Acquire);
        assert!(!back.is_null(), "fiber {} has nobody to yield to", self.id);

        tls::set_current_fiber(back);
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }
        unsafe { arch::switch_context(self.ctx.get(), (*back).ctx.get()) };
    }

    /// Rebind a terminated fiber to a new closure, reusing its stack.
    ///
    /// # Panics
    ///
    /// On a main fiber, a fiber that is not TERM, or one that still holds a
    /// closure.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_callback(Box::new(f));
    }

    pub(crate) fn reset_callback(&self, cb: Callback) {
        assert!(!self.is_main(), "main fiber {} cannot be reset", self.id);
        // TERM is published before the final switch-out saves the context.
        self.claim();
        let state = self.state();
        let live = self.callback.lock().is_some();
        if state != FiberState::Term || live {
            self.in_flight.store(false, Ordering::Release);
            if state != FiberState::Term {
                panic!("fiber {} reset in state {}", self.id, state);
            }
            panic!("fiber {} reset with a live closure", self.id);
        }

        *self.callback.lock() = Some(cb);
        unsafe { self.prepare_context() };
        self.set_state(FiberState::Ready);
        self.in_flight.store(false, Ordering::Release);
        trace!(fiber = %self.id, "fiber reset");
    }

    /// Wait until no other thread is between `resume` and the matching
    /// switch-out of this fiber, then take the claim.
    fn claim(&self) {
        let mut spins = 0u32;
        while self
            .in_flight
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn run_callback(&self) {
        let cb = self.callback.lock().take();
        let Some(cb) = cb else {
            warn!(fiber = %self.id, "fiber started without a closure");
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
            error!(fiber = %self.id, panic = panic_message(&*payload), "fiber closure panicked");
        }
    }

    fn finish(&self) -> ! {
        self.set_state(FiberState::Term);
        trace!(fiber = %self.id, "fiber terminated");
        self.yield_now();
        error!(fiber = %self.id, "terminated fiber was resumed");
        std::process::abort();
    }

    // ---- thread-level helpers --------------------------------------------

    fn current_ptr() -> *const Fiber {
        let cur = tls::current_fiber();
        if !cur.is_null() {
            return cur;
        }
        let main = Fiber::new_main();
        let ptr = Arc::as_ptr(&main);
        tls::set_thread_fiber(main);
        tls::set_current_fiber(ptr);
        ptr
    }

    /// The fiber running on this thread, creating the main fiber if needed.
    pub fn current() -> FiberRef {
        let ptr = Self::current_ptr();
        // Every fiber pointer in thread-local storage belongs to a live Arc:
        // the running fiber is owned by whoever resumed it.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber without creating a main fiber.
    pub fn current_id() -> Option<FiberId> {
        let ptr = tls::current_fiber();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { (*ptr).id })
        }
    }

    /// Mark `fiber` as the one running on this thread.
    pub fn set_current(fiber: &FiberRef) {
        tls::set_current_fiber(Arc::as_ptr(fiber));
    }

    /// Yield the running fiber.
    ///
    /// # Panics
    ///
    /// When called on a thread's main fiber.
    pub fn yield_current() {
        let ptr = Self::current_ptr();
        unsafe { (*ptr).yield_now() };
    }

    /// Fibers alive in the process, main fibers included.
    pub fn live_count() -> usize {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

/// Entry point of every fiber stack. Never returns.
extern "C" fn fiber_entry(arg: usize) {
    // No owning handle is held on this stack: the frame is never unwound.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_callback();
    fiber.finish();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.is_main() {
            tls::release_thread(self as *const Fiber);
        } else if self.state() == FiberState::Running {
            error!(fiber = %self.id, "dropping a running fiber");
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    const SMALL: usize = 64 * 1024;

    #[test]
    fn main_fiber_is_created_lazily() {
        std::thread::spawn(|| {
            assert!(Fiber::current_id().is_none());
            let main = Fiber::current();
            assert!(main.is_main());
            assert_eq!(main.state(), FiberState::Running);
            assert_eq!(main.stack_size(), 0);
            assert_eq!(Fiber::current_id(), Some(main.id()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, SMALL, false);

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_interleaves_with_caller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(
            move || {
                l.lock().push("f1");
                Fiber::yield_current();
                l.lock().push("f2");
            },
            SMALL,
            false,
        );

        log.lock().push("m1");
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        log.lock().push("m2");
        fiber.resume();
        log.lock().push("m3");

        assert_eq!(*log.lock(), vec!["m1", "f1", "m2", "f2", "m3"]);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn current_inside_fiber_is_that_fiber() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(move || *s.lock() = Some(Fiber::current().id()), SMALL, false);
        let outer = Fiber::current().id();

        fiber.resume();
        assert_eq!(*seen.lock(), Some(fiber.id()));
        assert_eq!(Fiber::current().id(), outer);
    }

    #[test]
    fn nested_resume_returns_to_inner_resumer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());

        let inner = Fiber::new(
            move || {
                l2.lock().push("inner");
                Fiber::yield_current();
                l2.lock().push("inner-again");
            },
            SMALL,
            false,
        );
        let inner2 = inner.clone();
        let outer = Fiber::new(
            move || {
                inner2.resume();
                l1.lock().push("outer");
                inner2.resume();
            },
            SMALL,
            false,
        );

        outer.resume();
        assert_eq!(*log.lock(), vec!["inner", "outer", "inner-again"]);
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner.state(), FiberState::Term);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, SMALL, true);
        let top_before = fiber.stack.as_ref().unwrap().top();

        fiber.resume();
        let h = hits.clone();
        fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();

        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.stack.as_ref().unwrap().top(), top_before);
    }

    #[test]
    fn panic_in_closure_terminates_fiber() {
        let fiber = Fiber::new(|| panic!("boom"), SMALL, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    #[should_panic(expected = "resumed in state TERM")]
    fn resuming_terminated_fiber_panics() {
        let fiber = Fiber::new(|| {}, SMALL, false);
        fiber.resume();
        fiber.resume();
    }

    #[test]
    #[should_panic(expected = "reset in state READY")]
    fn reset_requires_term() {
        let fiber = Fiber::new(|| {}, SMALL, false);
        fiber.reset(|| {});
    }

    #[test]
    fn resume_from_another_thread() {
        let fiber = Fiber::new(
            || {
                Fiber::yield_current();
            },
            SMALL,
            true,
        );
        fiber.resume();
        let f = fiber.clone();
        std::thread::spawn(move || f.resume()).join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// READY before every resume, RUNNING inside, TERM exactly after the
        /// last one.
        #[test]
        fn state_sequence(yields in 0usize..16) {
            let inside = Arc::new(Mutex::new(Vec::new()));
            let i = inside.clone();
            let fiber = Fiber::new(
                move || {
                    for _ in 0..yields {
                        i.lock().push(Fiber::current().state());
                        Fiber::yield_current();
                    }
                    i.lock().push(Fiber::current().state());
                },
                SMALL,
                false,
            );

            for step in 0..=yields {
                prop_assert_eq!(fiber.state(), FiberState::Ready);
                fiber.resume();
                let expected = if step == yields { FiberState::Term } else { FiberState::Ready };
                prop_assert_eq!(fiber.state(), expected);
            }
            let inside = inside.lock();
            prop_assert_eq!(inside.len(), yields + 1);
            prop_assert!(inside.iter().all(|s| *s == FiberState::Running));
        }
    }
}
