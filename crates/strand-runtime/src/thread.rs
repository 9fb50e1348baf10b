//! Named OS threads
//!
//! [`Thread::spawn`] does not return until the new thread is running and
//! has reported its kernel thread id, so callers can use the id (for task
//! affinity) immediately.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use strand_core::{RuntimeError, RuntimeResult};
use tracing::debug;

/// Kernel thread id, as used for task affinity.
pub type Tid = libc::pid_t;

/// A joinable, named OS thread.
#[derive(Debug)]
pub struct Thread {
    name: String,
    tid: Tid,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Start `f` on a new thread called `name`.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> RuntimeResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel::<Tid>(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // The spawner is blocked on this; a send error means it gave up.
                let _ = tx.send(Thread::current_tid());
                f();
            })
            .map_err(|source| RuntimeError::ThreadSpawn { name: name.clone(), source })?;

        let tid = match rx.recv() {
            Ok(tid) => tid,
            // Thread died before reporting in.
            Err(_) => {
                let _ = handle.join();
                return Err(RuntimeError::ThreadPanicked(name));
            }
        };

        debug!(thread = %name, tid, "thread started");
        Ok(Thread { name, tid, handle: Some(handle) })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Wait for the thread to finish. Joining twice is a no-op.
    pub fn join(&mut self) -> RuntimeResult<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RuntimeError::ThreadPanicked(self.name.clone())),
            None => Ok(()),
        }
    }

    /// Kernel id of the calling thread.
    pub fn current_tid() -> Tid {
        nix::unistd::gettid().as_raw()
    }

    /// Name of the calling thread, `"UNKNOWN"` if unnamed.
    pub fn current_name() -> String {
        thread::current().name().unwrap_or("UNKNOWN").to_string()
    }
}
