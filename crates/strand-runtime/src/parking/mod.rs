//! Idle-worker parking for the base scheduler
//!
//! A scheduler without a reactor has nothing to block on when its queue is
//! empty, so idle workers park here and `tickle` wakes them.

use std::time::Duration;

/// Sleep/wake primitive shared by the workers of one scheduler.
pub trait IdleParking: Send + Sync {
    /// Block until woken or `timeout` elapses.
    ///
    /// Returns `true` when a wake-up was consumed. Callers re-check for work
    /// either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked worker, or leave a token for the next one to park.
    fn wake_one(&self);

    fn wake_all(&self);

    /// Parked workers right now (a hint).
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::CondvarParking as PlatformParking;
    }
}

/// Platform-appropriate parking instance.
pub fn new_parking() -> Box<dyn IdleParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn park_times_out() {
        let parking = new_parking();
        let start = Instant::now();
        assert!(!parking.park(Some(Duration::from_millis(40))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wake_before_park_is_not_lost() {
        let parking = new_parking();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Token consumed.
        assert!(!parking.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wake_one_releases_a_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let p = parking.clone();
        let handle = thread::spawn(move || p.park(Some(Duration::from_secs(10))));

        while parking.parked_count() == 0 {
            thread::yield_now();
        }
        parking.wake_one();
        assert!(handle.join().unwrap());
        assert_eq!(parking.parked_count(), 0);
    }
}
