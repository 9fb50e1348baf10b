//! # Reactor: the epoll idle driver
//!
//! A [`Reactor`] is a scheduler [`Driver`]. Workers with nothing to run sit
//! in `epoll_wait` instead of a futex, and wake up for three reasons:
//!
//! 1. a registered descriptor became readable or writable
//! 2. the earliest timer is due
//! 3. somebody wrote the wake pipe (`tickle`, or a new front timer)
//!
//! Registrations are one-shot and edge-triggered: when a direction fires it
//! is removed from the interest set and its waiter (a fiber or a callback)
//! is scheduled on the scheduler that registered it.
//!
//! ```text
//!   add_event(fd, READ) ──▶ epoll_ctl(ADD|MOD, EPOLLET | interest)
//!                                       │
//!   idle: epoll_wait(min(next timer, max_wait)) ◀─┘
//!      ├── wake pipe ──▶ drain
//!      ├── expired timers ──▶ schedule_batch
//!      └── fd ready ──▶ re-arm what is left ──▶ schedule waiter
//! ```
//!
//! [`IoManager`] owns a scheduler driven by a reactor.

use crate::syscall::originals;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use strand_core::env::env_get;
use strand_core::{ConfigError, Event, FiberState, RuntimeError, RuntimeResult};
use strand_runtime::config::{defaults, SchedulerConfig};
use strand_runtime::{Callback, Driver, Fiber, FiberRef, Scheduler, Task, Thread, Timer, TimerManager, TimerObserver};
use tracing::{debug, error, info, trace, warn};

/// epoll `data` of the wake pipe; descriptors use their own number.
const WAKE_TOKEN: u64 = u64::MAX;

// Event bits go to epoll untranslated.
const _: () = assert!(Event::READ.bits() == libc::EPOLLIN as u32);
const _: () = assert!(Event::WRITE.bits() == libc::EPOLLOUT as u32);

/// Reactor tuning.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound for one `epoll_wait`, in ms
    pub max_wait_ms: u64,
    /// Events fetched per `epoll_wait`
    pub max_events: usize,
    /// Initial size of the per-fd registration table
    pub event_table_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// Compile-time defaults with `STRAND_REACTOR_MAX_WAIT_MS`,
    /// `STRAND_REACTOR_MAX_EVENTS` and `STRAND_EVENT_TABLE_CAPACITY`
    /// overrides.
    pub fn from_env() -> Self {
        Self {
            max_wait_ms: env_get("STRAND_REACTOR_MAX_WAIT_MS", defaults::REACTOR_MAX_WAIT_MS),
            max_events: env_get("STRAND_REACTOR_MAX_EVENTS", defaults::REACTOR_MAX_EVENTS),
            event_table_capacity: env_get("STRAND_EVENT_TABLE_CAPACITY", defaults::EVENT_TABLE_CAPACITY),
        }
    }

    pub fn new() -> Self {
        Self {
            max_wait_ms: defaults::REACTOR_MAX_WAIT_MS,
            max_events: defaults::REACTOR_MAX_EVENTS,
            event_table_capacity: defaults::EVENT_TABLE_CAPACITY,
        }
    }

    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn event_table_capacity(mut self, n: usize) -> Self {
        self.event_table_capacity = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_wait_ms == 0 {
            return Err(ConfigError::Zero("max_wait_ms"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Zero("max_events"));
        }
        Ok(())
    }
}

// ============================================================================
// Wake pipe
// ============================================================================

/// Non-blocking pipe whose read end sits in the epoll set.
struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakePipe { read_fd: fds[0], write_fd: fds[1] })
    }

    fn notify(&self) {
        let n = unsafe { (originals().write)(self.write_fd, b"T".as_ptr().cast(), 1) };
        if n != 1 {
            // A full pipe already has a wake-up pending.
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %err, "wake pipe write failed");
            }
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 256];
        while unsafe { (originals().read)(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }
}

impl TimerObserver for WakePipe {
    fn on_timer_inserted_at_front(&self) {
        self.notify();
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        let close = originals().close;
        unsafe {
            close(self.read_fd);
            close(self.write_fd);
        }
    }
}

// ============================================================================
// Registrations
// ============================================================================

enum Waiter {
    Fiber(FiberRef),
    Callback(Callback),
}

#[derive(Default)]
struct EventSlot {
    scheduler: Option<Weak<Scheduler>>,
    waiter: Option<Waiter>,
}

/// Registrations of one descriptor.
struct FdEvents {
    fd: RawFd,
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdEvents {
    fn new(fd: RawFd) -> Self {
        FdEvents { fd, events: Event::NONE, read: EventSlot::default(), write: EventSlot::default() }
    }

    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("no slot for {:?} on fd {}", event, self.fd);
        }
    }
}

type EventCell = Arc<Mutex<FdEvents>>;

// ============================================================================
// Reactor
// ============================================================================

/// Epoll-backed idle driver plus the timers it waits on.
pub struct Reactor {
    name: String,
    config: ReactorConfig,
    epfd: RawFd,
    wake: Arc<WakePipe>,
    table: RwLock<Vec<EventCell>>,
    pending: AtomicUsize,
    timers: TimerManager,
    owner: OnceLock<Weak<Scheduler>>,
}

impl Reactor {
    /// Create the epoll instance and the wake pipe.
    pub fn new(name: &str, config: ReactorConfig) -> io::Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = match WakePipe::new() {
            Ok(pipe) => Arc::new(pipe),
            Err(e) => {
                unsafe { (originals().close)(epfd) };
                return Err(e);
            }
        };

        let mut ev = libc::epoll_event { events: (libc::EPOLLIN | libc::EPOLLET) as u32, u64: WAKE_TOKEN };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake.read_fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { (originals().close)(epfd) };
            return Err(err);
        }

        let table = (0..config.event_table_capacity)
            .map(|fd| Arc::new(Mutex::new(FdEvents::new(fd as RawFd))))
            .collect();

        debug!(reactor = name, epfd, capacity = config.event_table_capacity, "reactor created");
        Ok(Reactor {
            name: name.to_string(),
            timers: TimerManager::with_observer(wake.clone()),
            config,
            epfd,
            wake,
            table: RwLock::new(table),
            pending: AtomicUsize::new(0),
            owner: OnceLock::new(),
        })
    }

    /// Reactor driving the calling thread's scheduler, if it has one.
    pub fn current() -> Option<Arc<Reactor>> {
        let sched = Scheduler::current()?;
        sched.driver().clone().into_any().downcast::<Reactor>().ok()
    }

    pub(crate) fn bind(&self, sched: &Arc<Scheduler>) {
        let _ = self.owner.set(Arc::downgrade(sched));
    }

    /// Scheduler this reactor was created for.
    pub fn owner(&self) -> Option<Arc<Scheduler>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Registrations that have neither fired nor been removed.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // ---- registration ----------------------------------------------------

    /// Wait for `event` (one direction) on `fd`.
    ///
    /// With a callback, it is scheduled when the event fires. Without one,
    /// the calling fiber is, so it must be running and about to yield.
    ///
    /// # Panics
    ///
    /// If `event` is already registered for `fd`.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes a single direction, got {:?}",
            event
        );

        let cell = self.cell(fd);
        let mut st = cell.lock();
        if st.events.intersects(event) {
            error!(fd, ?event, registered = ?st.events, "event registered twice");
            panic!("fd {} already waits for {:?}", fd, event);
        }

        let op = if st.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        if let Err(e) = self.ctl(op, fd, st.events | event) {
            error!(reactor = %self.name, fd, ?event, error = %e, "epoll_ctl failed");
            return Err(e);
        }

        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let fiber = Fiber::current();
                assert!(!fiber.is_main(), "a thread's main fiber cannot wait for fd {}", fd);
                assert_eq!(fiber.state(), FiberState::Running, "waiting fiber must be running");
                Waiter::Fiber(fiber)
            }
        };
        let scheduler = Scheduler::current()
            .map(|s| Arc::downgrade(&s))
            .or_else(|| self.owner.get().cloned());

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events |= event;
        *st.slot_mut(event) = EventSlot { scheduler, waiter: Some(waiter) };
        trace!(fd, ?event, "event added");
        Ok(())
    }

    /// Drop a registration without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(cell) = self.lookup(fd) else {
            return false;
        };
        let mut st = cell.lock();
        if !st.events.contains(event) {
            return false;
        }
        let left = st.events & !event;
        if let Err(e) = self.rearm(fd, left) {
            error!(reactor = %self.name, fd, ?event, error = %e, "epoll_ctl failed");
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        st.events = left;
        *st.slot_mut(event) = EventSlot::default();
        true
    }

    /// Drop a registration and schedule its waiter as if it had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.cancel_event_with(fd, event, || true)
    }

    /// Like [`cancel_event`](Self::cancel_event), but asks `on_cancel`
    /// first. It runs under the descriptor lock, only while the
    /// registration exists, and returning false leaves the registration
    /// alone. A readiness notification and a cancellation can therefore
    /// never both reach the waiter.
    pub fn cancel_event_with<F>(&self, fd: RawFd, event: Event, on_cancel: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let Some(cell) = self.lookup(fd) else {
            return false;
        };
        let mut st = cell.lock();
        if !st.events.contains(event) || !on_cancel() {
            return false;
        }
        let left = st.events & !event;
        if let Err(e) = self.rearm(fd, left) {
            error!(reactor = %self.name, fd, ?event, error = %e, "epoll_ctl failed");
            return false;
        }
        self.trigger(&mut st, event);
        true
    }

    /// Cancel both directions of `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(cell) = self.lookup(fd) else {
            return false;
        };
        let mut st = cell.lock();
        if st.events.is_empty() {
            return false;
        }
        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, Event::NONE) {
            error!(reactor = %self.name, fd, error = %e, "epoll_ctl(DEL) failed");
            return false;
        }
        for event in [Event::READ, Event::WRITE] {
            if st.events.contains(event) {
                self.trigger(&mut st, event);
            }
        }
        true
    }

    // ---- timers ----------------------------------------------------------

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, C>(&self, ms: u64, cb: F, cond: Weak<C>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        C: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timer_ms(&self) -> u64 {
        self.timers.next_timer_ms()
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ---- internals -------------------------------------------------------

    fn lookup(&self, fd: RawFd) -> Option<EventCell> {
        let idx = usize::try_from(fd).ok()?;
        self.table.read().get(idx).cloned()
    }

    /// Cell for `fd`, growing the table as needed. `fd` is non-negative.
    fn cell(&self, fd: RawFd) -> EventCell {
        let idx = fd as usize;
        if let Some(cell) = self.table.read().get(idx) {
            return cell.clone();
        }
        let mut table = self.table.write();
        if idx >= table.len() {
            let len = (idx + 1).max(table.len() * 3 / 2);
            let start = table.len();
            table.extend((start..len).map(|i| Arc::new(Mutex::new(FdEvents::new(i as RawFd)))));
            trace!(reactor = %self.name, len, "event table grown");
        }
        table[idx].clone()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: libc::EPOLLET as u32 | events.bits(), u64: fd as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Keep epoll interested in `left` only.
    fn rearm(&self, fd: RawFd, left: Event) -> io::Result<()> {
        let op = if left.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, fd, left)
    }

    /// Clear `event` and hand its waiter to its scheduler.
    fn trigger(&self, st: &mut FdEvents, event: Event) {
        debug_assert!(st.events.contains(event));
        st.events.remove(event);
        let slot = std::mem::take(st.slot_mut(event));
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let Some(waiter) = slot.waiter else {
            return;
        };
        let Some(sched) = slot.scheduler.and_then(|w| w.upgrade()).or_else(|| self.owner()) else {
            warn!(reactor = %self.name, fd = st.fd, ?event, "no scheduler left for event waiter");
            return;
        };
        let task = match waiter {
            Waiter::Fiber(fiber) => Task::fiber(fiber),
            Waiter::Callback(cb) => Task::callback(cb),
        };
        trace!(fd = st.fd, ?event, "event fired");
        sched.schedule_task(task);
    }

    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: u64) -> usize {
        let timeout = timeout_ms.min(libc::c_int::MAX as u64) as libc::c_int;
        loop {
            let rc = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout) };
            if rc >= 0 {
                return rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                error!(reactor = %self.name, error = %err, "epoll_wait failed");
                return 0;
            }
        }
    }

    fn dispatch(&self, ev: libc::epoll_event) {
        let token = ev.u64;
        let bits = ev.events;
        if token == WAKE_TOKEN {
            self.wake.drain();
            return;
        }

        let fd = token as RawFd;
        let Some(cell) = self.lookup(fd) else {
            return;
        };
        let mut st = cell.lock();

        let mut ready = bits;
        if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            // Errors wake every armed direction; the retried call reports them.
            ready |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.events.bits();
        }
        let fired = Event::from_bits_truncate(ready) & st.events;
        if fired.is_empty() {
            return;
        }

        let left = st.events & !fired;
        if let Err(e) = self.rearm(fd, left) {
            error!(reactor = %self.name, fd, error = %e, "re-arm failed");
            return;
        }
        for event in [Event::READ, Event::WRITE] {
            if fired.contains(event) {
                self.trigger(&mut st, event);
            }
        }
    }
}

impl Driver for Reactor {
    fn tickle(&self, sched: &Scheduler) {
        if !sched.has_idle_threads() {
            return;
        }
        self.wake.notify();
    }

    fn idle(&self, sched: &Scheduler) {
        let tid = Thread::current_tid();
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.config.max_events];

        loop {
            if self.stopping(sched) {
                debug!(reactor = %self.name, tid, "idle exiting");
                // Wake the next worker blocked in epoll_wait.
                self.wake.notify();
                break;
            }
            if sched.has_runnable_for(tid) {
                Fiber::yield_current();
                continue;
            }

            let timeout = self.timers.next_timer_ms().min(self.config.max_wait_ms);
            let n = self.wait(&mut events, timeout);

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                trace!(reactor = %self.name, count = expired.len(), "timers expired");
                sched.schedule_batch(expired.into_iter().map(|cb| Task::callback(move || cb())));
            }

            for ev in &events[..n] {
                self.dispatch(*ev);
            }
            Fiber::yield_current();
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.default_stopping() && self.pending_events() == 0
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let pending = self.pending_events();
        if pending > 0 {
            warn!(reactor = %self.name, pending, "reactor dropped with registrations outstanding");
        }
        unsafe { (originals().close)(self.epfd) };
    }
}

// ============================================================================
// IoManager
// ============================================================================

/// A started scheduler whose workers idle in a [`Reactor`].
///
/// Dropping it stops the scheduler.
pub struct IoManager {
    sched: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<IoManager> {
        let config = SchedulerConfig::from_env()
            .threads(threads)
            .use_caller(use_caller)
            .name(name);
        Self::with_config(config, ReactorConfig::from_env())
    }

    pub fn with_config(sched_config: SchedulerConfig, reactor_config: ReactorConfig) -> RuntimeResult<IoManager> {
        reactor_config.validate()?;
        let reactor = Arc::new(Reactor::new(&sched_config.name, reactor_config).map_err(RuntimeError::Reactor)?);
        let sched = Scheduler::with_driver(sched_config, reactor.clone())?;
        reactor.bind(&sched);
        sched.start()?;
        info!(io_manager = %sched.name(), threads = sched.config().threads, "io manager started");
        Ok(IoManager { sched, reactor })
    }

    /// Reactor of the scheduler running on this thread.
    pub fn current_reactor() -> Option<Arc<Reactor>> {
        Reactor::current()
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn name(&self) -> &str {
        self.sched.name()
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: FiberRef) {
        self.sched.schedule_fiber(fiber);
    }

    pub fn schedule_task(&self, task: Task) {
        self.sched.schedule_task(task);
    }

    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> io::Result<()> {
        self.reactor.add_event(fd, event, cb)
    }

    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, C>(&self, ms: u64, cb: F, cond: Weak<C>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        C: ?Sized + Send + Sync + 'static,
    {
        self.reactor.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timer_ms(&self) -> u64 {
        self.reactor.next_timer_ms()
    }

    pub fn has_timer(&self) -> bool {
        self.reactor.has_timer()
    }

    /// Wait for queued work and registrations to drain, then join the
    /// workers. Idempotent.
    pub fn stop(&self) {
        self.sched.stop();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched)
            .field("reactor", &self.reactor)
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        fds
    }

    fn close(fd: RawFd) {
        unsafe { (originals().close)(fd) };
    }

    fn counter_cb(hits: &Arc<AtomicUsize>) -> Callback {
        let h = hits.clone();
        Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_for(hits: &AtomicUsize, want: usize) {
        for _ in 0..400 {
            if hits.load(Ordering::SeqCst) >= want {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn config_validation() {
        assert!(ReactorConfig::new().validate().is_ok());
        assert!(matches!(ReactorConfig::new().max_events(0).validate(), Err(ConfigError::Zero("max_events"))));
        assert!(ReactorConfig::new().max_wait_ms(0).validate().is_err());
        assert_eq!(ReactorConfig::new().event_table_capacity, defaults::EVENT_TABLE_CAPACITY);
    }

    #[test]
    fn wake_pipe_drains() {
        let pipe = WakePipe::new().unwrap();
        pipe.notify();
        pipe.notify();
        pipe.drain();
        let mut b = [0u8; 1];
        let n = unsafe { (originals().read)(pipe.read_fd, b.as_mut_ptr().cast(), 1) };
        assert_eq!(n, -1);
    }

    #[test]
    fn event_table_grows() {
        let reactor = Reactor::new("grow", ReactorConfig::new().event_table_capacity(4)).unwrap();
        assert_eq!(reactor.table.read().len(), 4);
        reactor.cell(10);
        assert_eq!(reactor.table.read().len(), 11);
        reactor.cell(11);
        assert_eq!(reactor.table.read().len(), 16);
        assert!(reactor.lookup(-1).is_none());
        assert!(reactor.lookup(100).is_none());
    }

    #[test]
    fn cancel_fires_exactly_once() {
        let iom = IoManager::new(1, false, "cancel").unwrap();
        let [a, b] = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        iom.add_event(a, Event::READ, Some(counter_cb(&hits))).unwrap();
        assert_eq!(iom.reactor().pending_events(), 1);
        assert!(iom.cancel_event(a, Event::READ));
        assert!(!iom.cancel_event(a, Event::READ));
        assert_eq!(iom.reactor().pending_events(), 0);

        wait_for(&hits, 1);
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        close(a);
        close(b);
    }

    #[test]
    fn cancel_hook_runs_only_when_armed() {
        let iom = IoManager::new(1, false, "hook").unwrap();
        let [a, b] = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let marks = AtomicUsize::new(0);

        iom.add_event(a, Event::READ, Some(counter_cb(&hits))).unwrap();
        assert!(!iom.reactor().cancel_event_with(a, Event::READ, || {
            marks.fetch_add(1, Ordering::SeqCst);
            false
        }));
        assert_eq!(iom.reactor().pending_events(), 1);
        assert!(iom.reactor().cancel_event_with(a, Event::READ, || {
            marks.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert!(!iom.reactor().cancel_event_with(a, Event::READ, || {
            marks.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert_eq!(marks.load(Ordering::SeqCst), 2);

        wait_for(&hits, 1);
        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn del_does_not_fire() {
        let iom = IoManager::new(1, false, "del").unwrap();
        let [a, b] = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        iom.add_event(a, Event::READ, Some(counter_cb(&hits))).unwrap();
        assert!(iom.del_event(a, Event::READ));
        assert!(!iom.del_event(a, Event::READ));
        assert!(!iom.cancel_all(a));

        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        close(a);
        close(b);
    }

    #[test]
    fn cancel_all_wakes_both_directions() {
        let iom = IoManager::new(2, false, "all").unwrap();
        let [a, b] = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        // WRITE may fire on its own (the socket is writable); either way
        // each waiter runs once.
        iom.add_event(a, Event::READ, Some(counter_cb(&hits))).unwrap();
        iom.add_event(a, Event::WRITE, Some(counter_cb(&hits))).unwrap();
        assert!(iom.cancel_all(a));
        assert_eq!(iom.reactor().pending_events(), 0);

        wait_for(&hits, 2);
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        close(a);
        close(b);
    }

    #[test]
    #[should_panic(expected = "already waits")]
    fn double_registration_panics() {
        let reactor = Reactor::new("double", ReactorConfig::new()).unwrap();
        let [a, _b] = socketpair();
        reactor.add_event(a, Event::READ, Some(Box::new(|| {}))).unwrap();
        let _ = reactor.add_event(a, Event::READ, Some(Box::new(|| {})));
    }

    #[test]
    fn current_is_none_off_worker() {
        assert!(Reactor::current().is_none());
    }

    #[test]
    fn readiness_fires_callback() {
        let iom = IoManager::new(1, false, "ready").unwrap();
        let [a, b] = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        iom.add_event(a, Event::READ, Some(counter_cb(&hits))).unwrap();
        let n = unsafe { (originals().write)(b, b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);

        wait_for(&hits, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.reactor().pending_events(), 0);
        iom.stop();
        close(a);
        close(b);
    }
}
