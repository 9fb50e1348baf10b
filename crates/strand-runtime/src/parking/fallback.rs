//! Condvar-based parking for targets without futex

use super::IdleParking;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct CondvarParking {
    /// Pending wake token
    token: Mutex<bool>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl CondvarParking {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for CondvarParking {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleParking for CondvarParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut token = self.token.lock();
        if !*token {
            self.parked.fetch_add(1, Ordering::SeqCst);
            match timeout {
                Some(d) => {
                    self.cond.wait_for(&mut token, d);
                }
                None => self.cond.wait(&mut token),
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
        std::mem::replace(&mut *token, false)
    }

    fn wake_one(&self) {
        *self.token.lock() = true;
        self.cond.notify_one();
    }

    fn wake_all(&self) {
        *self.token.lock() = true;
        self.cond.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
