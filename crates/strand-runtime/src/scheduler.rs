//! N:M fiber scheduler
//!
//! A [`Scheduler`] runs closures and fibers from one FIFO queue on a fixed
//! set of OS threads. Nothing is preempted: a task runs until it finishes or
//! yields.
//!
//! ```text
//!   schedule(f) ──▶ [ VecDeque<Task> ] ◀── claim (affinity-aware) ── worker run loop
//!                                                                     │
//!            ┌────────────── nothing claimable ──────────────────────┘
//!            ▼
//!      idle fiber (Driver::idle) ── park / epoll ── yield back
//! ```
//!
//! Each worker thread runs [`Scheduler::run`] on its main fiber. With
//! `use_caller`, the constructing thread also becomes a worker, but only
//! while `stop()` drives its root fiber.
//!
//! What "idle" and "wake up" mean is delegated to a [`Driver`]: the
//! [`ParkingDriver`] parks on a futex, the reactor in `strand-io` waits in
//! epoll.

use crate::config::SchedulerConfig;
use crate::fiber::{Callback, Fiber, FiberRef};
use crate::parking::{new_parking, IdleParking};
use crate::thread::{Thread, Tid};
use crate::tls;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use strand_core::{FiberState, RuntimeError, RuntimeResult};
use tracing::{debug, info, trace, warn};

/// Idle/wake policy plugged into a scheduler.
pub trait Driver: Send + Sync + 'static {
    /// Some work may have become available; wake an idle worker.
    fn tickle(&self, sched: &Scheduler);

    /// Body of every worker's idle fiber. Must yield back whenever work
    /// might be claimable, and return for good once `stopping` holds.
    fn idle(&self, sched: &Scheduler);

    /// Whether the scheduler may shut down.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.default_stopping()
    }

    /// Upcast for downcasting back to the concrete driver.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// What a task runs.
pub enum Schedulable {
    Fiber(FiberRef),
    Callback(Callback),
}

/// A unit of work plus optional thread affinity.
pub struct Task {
    unit: Schedulable,
    thread: Option<Tid>,
}

impl Task {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task { unit: Schedulable::Callback(Box::new(f)), thread: None }
    }

    pub fn fiber(fiber: FiberRef) -> Self {
        Task { unit: Schedulable::Fiber(fiber), thread: None }
    }

    /// Only the worker with kernel thread id `tid` may run this task.
    pub fn on_thread(mut self, tid: Tid) -> Self {
        self.thread = Some(tid);
        self
    }

    #[inline]
    pub fn thread(&self) -> Option<Tid> {
        self.thread
    }

    #[inline]
    fn runnable_on(&self, tid: Tid) -> bool {
        self.thread.map_or(true, |want| want == tid)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match &self.unit {
            Schedulable::Fiber(fiber) => format!("fiber {}", fiber.id()),
            Schedulable::Callback(_) => "callback".to_string(),
        };
        f.debug_struct("Task").field("unit", &unit).field("thread", &self.thread).finish()
    }
}

/// Cooperative N:M scheduler.
pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    driver: Arc<dyn Driver>,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<Tid>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    root_fiber: OnceLock<FiberRef>,
    root_tid: Option<Tid>,
}

impl Scheduler {
    /// Scheduler with the parking driver and environment defaults.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<Scheduler>> {
        let config = SchedulerConfig::from_env()
            .threads(threads)
            .use_caller(use_caller)
            .name(name);
        let driver = Arc::new(ParkingDriver::new(config.idle_park));
        Self::with_driver(config, driver)
    }

    /// Scheduler with an explicit configuration and idle policy.
    ///
    /// With `use_caller` the calling thread is bound to the new scheduler and
    /// gets a root fiber that runs the scheduling loop during `stop()`.
    ///
    /// # Panics
    ///
    /// With `use_caller`, if the calling thread already belongs to a
    /// scheduler.
    pub fn with_driver(config: SchedulerConfig, driver: Arc<dyn Driver>) -> RuntimeResult<Arc<Scheduler>> {
        config.validate()?;
        if config.use_caller {
            assert!(
                tls::scheduler().is_none(),
                "thread already runs a scheduler; cannot create `{}` with use_caller",
                config.name
            );
        }

        let root_tid = config.use_caller.then(Thread::current_tid);
        let sched = Arc::new(Scheduler {
            name: config.name.clone(),
            driver,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(root_tid.into_iter().collect()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            root_fiber: OnceLock::new(),
            root_tid,
            config,
        });

        if sched.config.use_caller {
            // Make sure the caller's main fiber exists before the root
            // fiber is resumed from it.
            Fiber::current();
            let weak = Arc::downgrade(&sched);
            let root = Fiber::try_new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                },
                sched.config.stack_size,
                false,
            )?;
            tls::set_scheduler(Some(Arc::downgrade(&sched)));
            tls::set_scheduling_fiber(Arc::as_ptr(&root));
            let _ = sched.root_fiber.set(root);
        }

        debug!(scheduler = %sched.name, threads = sched.config.threads, use_caller = sched.config.use_caller, "scheduler created");
        Ok(sched)
    }

    /// Scheduler bound to the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Kernel ids of every thread that runs this scheduler's loop.
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.lock().clone()
    }

    /// Caller thread id when constructed with `use_caller`.
    pub fn root_tid(&self) -> Option<Tid> {
        self.root_tid
    }

    /// Tasks executing right now.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers currently inside their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Whether a task that thread `tid` may run is queued.
    pub fn has_runnable_for(&self, tid: Tid) -> bool {
        self.queue.lock().iter().any(|t| t.runnable_on(tid))
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// `stop()` has been called.
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop requested, queue empty and no task executing.
    pub fn default_stopping(&self) -> bool {
        if !self.stop_requested() {
            return false;
        }
        let queue = self.queue.lock();
        queue.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Whether the scheduler may shut down, as decided by its driver.
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    #[inline]
    pub fn tickle(&self) {
        self.driver.tickle(self);
    }

    // ---- submission ------------------------------------------------------

    /// Queue a closure on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::callback(f));
    }

    /// Queue a READY fiber for resumption.
    pub fn schedule_fiber(&self, fiber: FiberRef) {
        self.schedule_task(Task::fiber(fiber));
    }

    pub fn schedule_task(&self, task: Task) {
        trace!(scheduler = %self.name, ?task, "schedule");
        self.queue.lock().push_back(task);
        self.tickle();
    }

    /// Queue several tasks under one lock acquisition.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let added = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.extend(tasks);
            queue.len() - before
        };
        if added > 0 {
            self.tickle();
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Spawn the worker threads (`threads`, minus one with `use_caller`).
    pub fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted(self.name.clone()));
        }
        if self.stop_requested() {
            warn!(scheduler = %self.name, "start() after stop(); ignored");
            return Ok(());
        }

        let mut threads = self.threads.lock();
        for i in 0..self.config.spawned_threads() {
            let me = Arc::clone(self);
            let thread = Thread::spawn(format!("{}_{}", self.name, i), move || me.run())?;
            self.thread_ids.lock().push(thread.tid());
            threads.push(thread);
        }
        info!(scheduler = %self.name, workers = threads.len(), "scheduler started");
        Ok(())
    }

    /// Request shutdown and wait for every worker to drain and exit.
    ///
    /// Idempotent. With `use_caller` it must be called from the thread that
    /// created the scheduler, which then runs the loop itself until done;
    /// otherwise it must not be called from one of the workers.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!(scheduler = %self.name, "stop() already in progress");
            return;
        }
        info!(scheduler = %self.name, "stopping");

        let root = self.root_fiber.get().cloned();
        if root.is_some() {
            assert!(
                tls::is_scheduler(self),
                "scheduler `{}` must be stopped from the thread that created it",
                self.name
            );
        } else {
            assert!(
                !tls::is_scheduler(self),
                "scheduler `{}` cannot be stopped from its own worker",
                self.name
            );
        }

        for _ in 0..self.config.spawned_threads() {
            self.tickle();
        }

        if let Some(root) = &root {
            self.tickle();
            if root.state() == FiberState::Ready {
                root.resume();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for mut thread in threads {
            if let Err(e) = thread.join() {
                warn!(scheduler = %self.name, error = %e, "worker did not exit cleanly");
            }
        }

        if root.is_some() {
            tls::set_scheduling_fiber(std::ptr::null());
            tls::set_scheduler(None);
            tls::set_hook_enabled(false);
        }
        info!(scheduler = %self.name, "stopped");
    }

    /// Claim the first task this thread may run.
    ///
    /// The second value asks for a tickle: either a task was skipped for
    /// affinity, or work remains after the claim.
    fn take_task(&self, tid: Tid) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();
        let mut skipped = false;
        let pos = queue.iter().position(|task| {
            let ok = task.runnable_on(tid);
            skipped |= !ok;
            ok
        });
        let task = pos.and_then(|i| queue.remove(i));
        if task.is_some() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        let tickle = skipped || (task.is_some() && !queue.is_empty());
        (task, tickle)
    }

    /// Scheduling loop; runs on every worker's main fiber and on the
    /// caller's root fiber.
    fn run(self: &Arc<Self>) {
        let tid = Thread::current_tid();
        debug!(scheduler = %self.name, tid, "worker loop entered");

        tls::set_scheduler(Some(Arc::downgrade(self)));
        tls::set_hook_enabled(self.config.hook_enabled);
        if self.root_tid != Some(tid) {
            let main = Fiber::current();
            tls::set_scheduling_fiber(Arc::as_ptr(&main));
        }

        let idle_fiber = {
            let me = Arc::clone(self);
            Fiber::new(move || me.driver.idle(&me), self.config.stack_size, true)
        };
        let mut cb_fiber: Option<FiberRef> = None;

        loop {
            let (task, tickle) = self.take_task(tid);
            if tickle {
                self.tickle();
            }

            match task.map(|t| t.unit) {
                Some(Schedulable::Fiber(fiber)) => {
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Schedulable::Callback(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_callback(cb);
                            fiber
                        }
                        None => Fiber::from_callback(cb, self.config.stack_size, true),
                    };
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    // A callback that blocked now belongs to whoever will
                    // wake it; only a finished one can be recycled.
                    if fiber.state() == FiberState::Term {
                        cb_fiber = Some(fiber);
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        debug!(scheduler = %self.name, tid, "idle fiber finished");
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!(scheduler = %self.name, tid, "worker loop exited");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.config.threads)
            .field("use_caller", &self.config.use_caller)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("stopping", &self.stop_requested())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) && !self.stop_requested() {
            warn!(scheduler = %self.name, "scheduler dropped without stop()");
        }
    }
}

/// Idle policy for schedulers without a reactor: park on a futex.
pub struct ParkingDriver {
    parking: Box<dyn IdleParking>,
    park_timeout: Duration,
}

impl ParkingDriver {
    pub fn new(park_timeout: Duration) -> Self {
        ParkingDriver { parking: new_parking(), park_timeout }
    }
}

impl Driver for ParkingDriver {
    fn tickle(&self, _sched: &Scheduler) {
        self.parking.wake_one();
    }

    fn idle(&self, sched: &Scheduler) {
        let tid = Thread::current_tid();
        loop {
            if self.stopping(sched) {
                // Let the other parked workers notice too.
                self.parking.wake_all();
                break;
            }
            if !sched.has_runnable_for(tid) {
                self.parking.park(Some(self.park_timeout));
            }
            Fiber::yield_current();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
