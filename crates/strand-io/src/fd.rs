//! Descriptor registry
//!
//! Hooks need to know, per descriptor, whether it is a socket, who asked
//! for non-blocking mode, and the `SO_RCVTIMEO`/`SO_SNDTIMEO` values. The
//! registry is a process-wide table indexed by fd.
//!
//! Sockets are switched to `O_NONBLOCK` when first registered (the
//! "system" non-blocking flag); what the application asked for is tracked
//! separately as "user" non-blocking and reported back by the hooked
//! `fcntl`.

use crate::syscall::originals;
use parking_lot::RwLock;
use std::fmt;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use strand_core::constants::NO_TIMEOUT;
use strand_core::env::env_get;
use strand_runtime::config::defaults;
use tracing::trace;

/// Which direction a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

impl TimeoutKind {
    /// Map a `SOL_SOCKET` option name.
    pub fn from_optname(optname: libc::c_int) -> Option<Self> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// What the runtime knows about one open descriptor.
pub struct FdContext {
    fd: RawFd,
    initialized: bool,
    socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdContext {
    /// Inspect `fd`. Sockets are put into `O_NONBLOCK` mode.
    pub fn new(fd: RawFd) -> Self {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        let stat_ok = unsafe { libc::fstat(fd, st.as_mut_ptr()) } == 0;
        let socket = stat_ok && {
            let st = unsafe { st.assume_init() };
            st.st_mode & libc::S_IFMT == libc::S_IFSOCK
        };

        let mut sys_nonblock = false;
        if socket {
            let fcntl = originals().fcntl;
            let flags = unsafe { fcntl(fd, libc::F_GETFL) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        FdContext {
            fd,
            initialized: stat_ok,
            socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.socket
    }

    /// The runtime put the descriptor into `O_NONBLOCK` mode.
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The application asked for `O_NONBLOCK` itself.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout in ms, or `NO_TIMEOUT`.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

impl fmt::Debug for FdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd)
            .field("socket", &self.socket)
            .field("sys_nonblock", &self.sys_nonblock)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .field("recv_timeout", &self.timeout(TimeoutKind::Recv))
            .field("send_timeout", &self.timeout(TimeoutKind::Send))
            .finish()
    }
}

/// Fd-indexed table of [`FdContext`]s.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();

impl FdRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        FdRegistry { slots: RwLock::new(vec![None; capacity]) }
    }

    /// Process-wide registry (`STRAND_FD_TABLE_CAPACITY` initial slots).
    pub fn global() -> &'static FdRegistry {
        REGISTRY.get_or_init(|| {
            FdRegistry::with_capacity(env_get("STRAND_FD_TABLE_CAPACITY", defaults::FD_TABLE_CAPACITY))
        })
    }

    /// Context for `fd`; created on a miss when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let len = (idx + 1).max(slots.len() * 3 / 2);
            slots.resize(len, None);
        }
        // Another thread may have won the race for the write lock.
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdContext::new(fd));
        slots[idx] = Some(ctx.clone());
        drop(slots);
        trace!(fd, socket = ctx.is_socket(), "fd registered");
        Some(ctx)
    }

    /// Forget `fd`. Marks the context closed for anyone still holding it.
    pub fn del(&self, fd: RawFd) {
        let Ok(idx) = usize::try_from(fd) else {
            return;
        };
        let removed = {
            let mut slots = self.slots.write();
            slots.get_mut(idx).and_then(Option::take)
        };
        if let Some(ctx) = removed {
            ctx.set_closed();
            trace!(fd, "fd unregistered");
        }
    }

    /// Table size (not the number of registered descriptors).
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

impl fmt::Debug for FdRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("FdRegistry")
            .field("capacity", &slots.len())
            .field("registered", &slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        fds
    }

    fn close(fd: RawFd) {
        unsafe { (originals().close)(fd) };
    }

    #[test]
    fn sockets_become_nonblocking() {
        let [a, b] = socketpair();
        let reg = FdRegistry::with_capacity(4);
        let ctx = reg.get(a, true).unwrap();
        assert!(ctx.is_initialized());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { (originals().fcntl)(a, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        close(a);
        close(b);
    }

    #[test]
    fn pipes_are_not_sockets() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdContext::new(fds[0]);
        assert!(ctx.is_initialized());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        close(fds[0]);
        close(fds[1]);
    }

    #[test]
    fn lookup_without_create() {
        let reg = FdRegistry::with_capacity(4);
        assert!(reg.get(3, false).is_none());
        assert!(reg.get(-1, true).is_none());
        assert!(reg.get(1000, false).is_none());
        assert_eq!(reg.capacity(), 4);
    }

    #[test]
    fn growth_covers_large_fds() {
        // High numbers that are not open: the contexts stay uninitialized.
        let reg = FdRegistry::with_capacity(4);
        assert!(!reg.get(900, true).unwrap().is_initialized());
        assert_eq!(reg.capacity(), 901);
        reg.get(901, true).unwrap();
        assert_eq!(reg.capacity(), 1351);
        assert!(reg.get(900, false).is_some());
    }

    #[test]
    fn same_context_until_deleted() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let reg = FdRegistry::with_capacity(8);
        let a = reg.get(fds[0], true).unwrap();
        let b = reg.get(fds[0], true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        reg.del(fds[0]);
        assert!(a.is_closed());
        assert!(reg.get(fds[0], false).is_none());
        reg.del(fds[0]);
        reg.del(-3);
        close(fds[0]);
        close(fds[1]);
    }

    #[test]
    fn timeouts_per_direction() {
        let ctx = FdContext::new(-1);
        assert!(!ctx.is_initialized());
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 100);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 100);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
        assert_eq!(TimeoutKind::from_optname(libc::SO_SNDTIMEO), Some(TimeoutKind::Send));
        assert_eq!(TimeoutKind::from_optname(libc::SO_KEEPALIVE), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Unopened descriptors only: registering an open socket would flip
        // it to O_NONBLOCK under another test.
        #[test]
        fn every_registered_fd_stays_reachable(fds in proptest::collection::vec(2000i32..6000, 1..40)) {
            let reg = FdRegistry::with_capacity(16);
            for &fd in &fds {
                prop_assert!(reg.get(fd, true).is_some());
            }
            let max = *fds.iter().max().unwrap_or(&0) as usize;
            prop_assert!(reg.capacity() > max);
            for &fd in &fds {
                prop_assert!(reg.get(fd, false).is_some());
            }
        }
    }
}
