//! Deadline timers
//!
//! A [`TimerManager`] keeps its live timers in a `BTreeMap` keyed by
//! `(deadline_ms, id)`, so the first entry is always the next to fire and
//! equal deadlines fire in creation order.
//!
//! ```text
//!   add_timer ──▶ (deadline, id) ──▶ list_expired(now) ──▶ Vec<callback>
//!                      ▲                    │
//!                      └── recurring: re-filed at now + period
//! ```
//!
//! The manager never runs callbacks. `list_expired` hands them to the
//! caller (the reactor schedules them as tasks) after every lock has been
//! released.

mod clock;

pub use clock::{now_ms, Clock, ManualClock, MonotonicClock};

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strand_core::constants::NO_TIMER;

/// Timer callbacks can fire more than once, so they are shared `Fn`s.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Notified when a timer lands in front of every other one, meaning a
/// sleeper waiting on the old front deadline waits too long.
pub trait TimerObserver: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

type Key = (u64, u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

struct TimerState {
    deadline: u64,
    period: u64,
    recurring: bool,
    /// `None` once cancelled or (one-shot) fired
    callback: Option<TimerCallback>,
}

/// One armed timer. Handles stay valid after the timer fired or was
/// cancelled; operations on them just report `false`.
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    manager: Weak<Shared>,
}

struct Shared {
    timers: RwLock<BTreeMap<Key, Arc<Timer>>>,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn TimerObserver>>,
}

impl Shared {
    fn notify_front(&self) {
        if let Some(observer) = &self.observer {
            observer.on_timer_inserted_at_front();
        }
    }
}

impl Timer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute deadline on the manager's clock.
    pub fn deadline_ms(&self) -> u64 {
        self.state.lock().deadline
    }

    pub fn period_ms(&self) -> u64 {
        self.state.lock().period
    }

    pub fn is_recurring(&self) -> bool {
        self.state.lock().recurring
    }

    /// Still armed (not cancelled, and not a fired one-shot).
    pub fn is_active(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    /// Disarm. Returns `false` if already cancelled or fired.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return self.state.lock().callback.take().is_some();
        };
        let mut timers = shared.timers.write();
        let mut st = self.state.lock();
        if st.callback.take().is_none() {
            return false;
        }
        timers.remove(&(st.deadline, self.id));
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.timers.write();
        let mut st = self.state.lock();
        if st.callback.is_none() {
            return false;
        }
        let Some(me) = timers.remove(&(st.deadline, self.id)) else {
            return false;
        };
        st.deadline = shared.clock.now_ms().saturating_add(st.period);
        timers.insert((st.deadline, self.id), me);
        true
    }

    /// Change the period to `ms`.
    ///
    /// With `from_now` the new deadline is now + `ms`; otherwise it is
    /// measured from when the current period started.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let at_front = {
            let mut timers = shared.timers.write();
            let mut st = self.state.lock();
            if st.callback.is_none() {
                return false;
            }
            if ms == st.period && !from_now {
                return true;
            }
            let Some(me) = timers.remove(&(st.deadline, self.id)) else {
                return false;
            };
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                st.deadline.saturating_sub(st.period)
            };
            st.period = ms;
            st.deadline = start.saturating_add(ms);
            let key = (st.deadline, self.id);
            timers.insert(key, me);
            timers.keys().next() == Some(&key)
        };
        if at_front {
            shared.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &st.deadline)
            .field("period", &st.period)
            .field("recurring", &st.recurring)
            .field("active", &st.callback.is_some())
            .finish()
    }
}

/// Ordered set of timers with expiry extraction.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    /// Monotonic clock, no observer.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(MonotonicClock), None)
    }

    /// Monotonic clock, `observer` told about new front timers.
    pub fn with_observer(observer: Arc<dyn TimerObserver>) -> Self {
        Self::with_parts(Arc::new(MonotonicClock), Some(observer))
    }

    pub fn with_parts(clock: Arc<dyn Clock>, observer: Option<Arc<dyn TimerObserver>>) -> Self {
        TimerManager {
            shared: Arc::new(Shared {
                timers: RwLock::new(BTreeMap::new()),
                clock,
                observer,
            }),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Arm a timer firing in `ms` milliseconds (then every `ms` if
    /// `recurring`).
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(ms, Arc::new(cb), recurring)
    }

    /// Like `add_timer`, but the callback only runs while `cond` can still
    /// be upgraded.
    pub fn add_condition_timer<F, C>(&self, ms: u64, cb: F, cond: Weak<C>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        C: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    pub fn add_callback(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let deadline = self.now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                deadline,
                period: ms,
                recurring,
                callback: Some(cb),
            }),
            manager: Arc::downgrade(&self.shared),
        });

        let key = (deadline, timer.id);
        let at_front = {
            let mut timers = self.shared.timers.write();
            timers.insert(key, timer.clone());
            timers.keys().next() == Some(&key)
        };
        if at_front {
            self.shared.notify_front();
        }
        timer
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// `NO_TIMER` if nothing is armed.
    pub fn next_timer_ms(&self) -> u64 {
        let timers = self.shared.timers.read();
        match timers.keys().next() {
            None => NO_TIMER,
            Some(&(deadline, _)) => deadline.saturating_sub(self.now_ms()),
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.timers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }

    /// Take every timer due at the manager's current time.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        self.list_expired_at(self.now_ms())
    }

    /// Take every timer with deadline <= `now`, re-file recurring ones at
    /// `now + period`, and return their callbacks in deadline order.
    pub fn list_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        {
            let timers = self.shared.timers.read();
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return Vec::new(),
            }
        }

        let mut timers = self.shared.timers.write();
        let later = match now.checked_add(1) {
            Some(bound) => timers.split_off(&(bound, 0)),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut *timers, later);

        let mut expired = Vec::with_capacity(due.len());
        for ((_, id), timer) in due {
            let mut st = timer.state.lock();
            let cb = if st.recurring { st.callback.clone() } else { st.callback.take() };
            let Some(cb) = cb else {
                continue;
            };
            expired.push(cb);
            if st.recurring {
                st.deadline = now.saturating_add(st.period);
                let key = (st.deadline, id);
                drop(st);
                timers.insert(key, timer);
            }
        }
        expired
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager").field("len", &self.len()).finish()
    }
}
