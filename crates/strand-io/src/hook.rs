//! # Blocking-style syscalls for fibers
//!
//! Each function here has the signature and errno contract of the libc call
//! it is named after. On a worker thread with hooking enabled, a call that
//! would block (`EAGAIN`) registers interest with the current [`Reactor`],
//! yields the calling fiber, and retries once the descriptor is ready. From
//! the fiber's point of view the call simply blocked.
//!
//! ```ignore
//! // inside a task on an IoManager worker
//! let n = unsafe { hook::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
//! unsafe { hook::usleep(10_000) };  // other fibers keep running
//! ```
//!
//! Off a reactor worker (a plain scheduler, a thread's main fiber) such a
//! call waits in `poll(2)` and retries, so it still blocks like the real
//! one. When hooking is disabled, the descriptor is unknown or not a
//! socket, or the application asked for `O_NONBLOCK`, the original call
//! runs unchanged.
//!
//! `SO_RCVTIMEO`/`SO_SNDTIMEO` are honoured with a timer: when it wins, the
//! call fails with `ETIMEDOUT`.

use crate::fd::{FdContext, FdRegistry, TimeoutKind};
use crate::reactor::Reactor;
use crate::syscall::originals;
use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, timeval,
    useconds_t,
};
use nix::errno::Errno;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use strand_core::constants::NO_TIMEOUT;
use strand_core::env::env_get;
use strand_core::Event;
use strand_runtime::config::defaults;
use strand_runtime::{tls, Fiber, Scheduler, Timer};
use tracing::{error, trace};

/// Whether hooks on this thread suspend fibers.
#[inline]
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

/// Enable or disable hooking for the calling thread.
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

static CONNECT_TIMEOUT_MS: OnceLock<AtomicU64> = OnceLock::new();

fn connect_timeout_cell() -> &'static AtomicU64 {
    CONNECT_TIMEOUT_MS.get_or_init(|| AtomicU64::new(env_get("STRAND_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS)))
}

/// Timeout used by [`connect`], in ms (`NO_TIMEOUT` for none).
pub fn connect_timeout() -> u64 {
    connect_timeout_cell().load(Ordering::Relaxed)
}

pub fn set_connect_timeout(ms: u64) {
    connect_timeout_cell().store(ms, Ordering::Relaxed);
}

#[inline]
fn errno() -> c_int {
    Errno::last() as c_int
}

#[inline]
fn set_errno(code: c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// Shared between one wait and its timeout timer.
///
/// Starts at zero. Whichever side moves it first wins: the timer stores
/// the errno to report, the woken fiber stores [`WOKEN`]. A timer callback
/// that loses the race must not touch the descriptor, which may already
/// carry the next wait's registration.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

const WOKEN: c_int = -1;

impl TimerInfo {
    /// Timer side. True if the wait had not finished yet.
    fn expire(&self, code: c_int) -> bool {
        self.cancelled.compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Fiber side, after waking. `Err` carries the timer's errno.
    fn settle(&self) -> Result<(), c_int> {
        match self.cancelled.compare_exchange(0, WOKEN, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(code) => Err(code),
        }
    }
}

/// Cancel the `event` wait on `fd` on behalf of an expired timer. Nothing
/// happens if the waiter already settled `info`.
fn expire_wait(reactor: &Reactor, fd: c_int, event: Event, info: &TimerInfo) -> bool {
    reactor.cancel_event_with(fd, event, || info.expire(libc::ETIMEDOUT))
}

/// Timer that cancels the `event` wait on `fd` after `ms`, unless the
/// readiness notification got there first.
fn arm_timeout(reactor: &Arc<Reactor>, fd: c_int, event: Event, ms: u64, info: &Arc<TimerInfo>) -> Arc<Timer> {
    let weak_reactor = Arc::downgrade(reactor);
    let weak_info = Arc::downgrade(info);
    reactor.add_condition_timer(
        ms,
        move || {
            if let (Some(info), Some(reactor)) = (weak_info.upgrade(), weak_reactor.upgrade()) {
                expire_wait(&reactor, fd, event, &info);
            }
        },
        Arc::downgrade(info),
        false,
    )
}

/// Block until `fd` is ready for `event`, `timeout` ms pass, or the
/// descriptor is closed. `Err` holds the errno for the caller.
///
/// A fiber on a reactor worker parks and lets the worker run other tasks.
/// Any other caller (a plain scheduler, a thread's main fiber) waits in
/// `poll(2)`, as the blocking call it replaced would have.
fn wait_ready(ctx: &FdContext, fd: c_int, call: &'static str, event: Event, timeout: u64) -> Result<(), c_int> {
    let parked = match Reactor::current() {
        Some(reactor) if !Fiber::current().is_main() => park_on(&reactor, fd, call, event, timeout),
        _ => poll_ready(fd, event, timeout),
    };
    parked?;
    if ctx.is_closed() {
        return Err(libc::EBADF);
    }
    Ok(())
}

fn park_on(reactor: &Arc<Reactor>, fd: c_int, call: &'static str, event: Event, timeout: u64) -> Result<(), c_int> {
    if let Err(e) = reactor.add_event(fd, event, None) {
        error!(fd, call, ?event, error = %e, "cannot wait for descriptor");
        return Err(e.raw_os_error().unwrap_or(libc::EIO));
    }
    // Armed after the registration exists, so an early expiry always has
    // something to cancel.
    let info = Arc::new(TimerInfo::default());
    let timer = (timeout != NO_TIMEOUT).then(|| arm_timeout(reactor, fd, event, timeout, &info));

    Fiber::yield_current();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    info.settle().inspect_err(|_| trace!(fd, call, "timed out"))
}

fn poll_ready(fd: c_int, event: Event, timeout: u64) -> Result<(), c_int> {
    let events = if event == Event::READ { libc::POLLIN } else { libc::POLLOUT };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let deadline = match timeout {
        NO_TIMEOUT => None,
        ms => Instant::now().checked_add(Duration::from_millis(ms)),
    };
    loop {
        let wait_ms = match deadline {
            None => -1,
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now()).as_millis();
                c_int::try_from(left).unwrap_or(c_int::MAX)
            }
        };
        match unsafe { libc::poll(&mut pfd, 1, wait_ms) } {
            0 => return Err(libc::ETIMEDOUT),
            rc if rc > 0 => return Ok(()),
            _ if errno() == libc::EINTR => continue,
            _ => return Err(errno()),
        }
    }
}

/// Run `op` until it does not report `EAGAIN`, waiting on `fd` in between.
fn do_io<F>(fd: c_int, call: &'static str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return op();
    }
    let Some(ctx) = FdRegistry::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }
        trace!(fd, call, ?event, "would block");
        if let Err(code) = wait_ready(&ctx, fd, call, event, timeout) {
            set_errno(code);
            return -1;
        }
    }
}

/// Suspend the calling fiber for `ms`, letting its worker run other
/// tasks. Returns false, without sleeping, when the caller is not a fiber
/// on a hooked reactor worker.
pub fn fiber_sleep(ms: u64) -> bool {
    if !is_hook_enabled() {
        return false;
    }
    let (Some(reactor), Some(sched)) = (Reactor::current(), Scheduler::current()) else {
        return false;
    };
    let fiber = Fiber::current();
    if fiber.is_main() {
        return false;
    }

    let sched = Arc::downgrade(&sched);
    reactor.add_timer(
        ms,
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_current();
    true
}

/// Registered, open socket context for `fd`.
fn socket_ctx(fd: c_int) -> Option<Arc<FdContext>> {
    FdRegistry::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

// ============================================================================
// Sleep
// ============================================================================

/// # Safety
///
/// Same contract as `sleep(3)`.
pub unsafe fn sleep(seconds: c_uint) -> c_uint {
    if fiber_sleep(u64::from(seconds) * 1000) {
        0
    } else {
        (originals().sleep)(seconds)
    }
}

/// # Safety
///
/// Same contract as `usleep(3)`.
pub unsafe fn usleep(usec: useconds_t) -> c_int {
    if fiber_sleep(u64::from(usec) / 1000) {
        0
    } else {
        (originals().usleep)(usec)
    }
}

/// # Safety
///
/// Same contract as `nanosleep(2)`.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if req.is_null() {
        return (originals().nanosleep)(req, rem);
    }
    let ts = &*req;
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return (originals().nanosleep)(req, rem);
    }
    let ms = ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000;
    if !fiber_sleep(ms) {
        return (originals().nanosleep)(req, rem);
    }
    if !rem.is_null() {
        *rem = mem::zeroed();
    }
    0
}

// ============================================================================
// Sockets
// ============================================================================

/// # Safety
///
/// Same contract as `socket(2)`.
pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (originals().socket)(domain, ty, protocol);
    if fd >= 0 && is_hook_enabled() {
        FdRegistry::global().get(fd, true);
    }
    fd
}

/// `connect` giving up with `ETIMEDOUT` after `timeout_ms`
/// (`NO_TIMEOUT` waits forever).
///
/// # Safety
///
/// Same contract as `connect(2)`.
pub unsafe fn connect_with_timeout(fd: c_int, addr: *const sockaddr, addrlen: socklen_t, timeout_ms: u64) -> c_int {
    let o = originals();
    if !is_hook_enabled() {
        return (o.connect)(fd, addr, addrlen);
    }
    let Some(ctx) = FdRegistry::global().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return (o.connect)(fd, addr, addrlen);
    }

    let n = (o.connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    if let Err(code) = wait_ready(&ctx, fd, "connect", Event::WRITE, timeout_ms) {
        set_errno(code);
        return -1;
    }

    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let rc = (o.getsockopt)(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&mut err as *mut c_int).cast(), &mut len);
    if rc == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// `connect` with the process-wide [`connect_timeout`].
///
/// # Safety
///
/// Same contract as `connect(2)`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout())
}

/// # Safety
///
/// Same contract as `accept(2)`.
pub unsafe fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let o = originals();
    let fd = do_io(sockfd, "accept", Event::READ, TimeoutKind::Recv, || {
        (o.accept)(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && is_hook_enabled() {
        FdRegistry::global().get(fd, true);
    }
    fd
}

// ============================================================================
// Read side
// ============================================================================

/// # Safety
///
/// Same contract as `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let o = originals();
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || (o.read)(fd, buf, count))
}

/// # Safety
///
/// Same contract as `readv(2)`.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let o = originals();
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || (o.readv)(fd, iov, iovcnt))
}

/// # Safety
///
/// Same contract as `recv(2)`.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let o = originals();
    do_io(sockfd, "recv", Event::READ, TimeoutKind::Recv, || (o.recv)(sockfd, buf, len, flags))
}

/// # Safety
///
/// Same contract as `recvfrom(2)`.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let o = originals();
    do_io(sockfd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        (o.recvfrom)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// Same contract as `recvmsg(2)`.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let o = originals();
    do_io(sockfd, "recvmsg", Event::READ, TimeoutKind::Recv, || (o.recvmsg)(sockfd, msg, flags))
}

// ============================================================================
// Write side
// ============================================================================

/// # Safety
///
/// Same contract as `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let o = originals();
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || (o.write)(fd, buf, count))
}

/// # Safety
///
/// Same contract as `writev(2)`.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let o = originals();
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || (o.writev)(fd, iov, iovcnt))
}

/// # Safety
///
/// Same contract as `send(2)`.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let o = originals();
    do_io(sockfd, "send", Event::WRITE, TimeoutKind::Send, || (o.send)(sockfd, buf, len, flags))
}

/// # Safety
///
/// Same contract as `sendto(2)`.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let o = originals();
    do_io(sockfd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        (o.sendto)(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
///
/// Same contract as `sendmsg(2)`.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let o = originals();
    do_io(sockfd, "sendmsg", Event::WRITE, TimeoutKind::Send, || (o.sendmsg)(sockfd, msg, flags))
}

// ============================================================================
// Descriptor control
// ============================================================================

/// Cancels pending waits on `fd` (they wake up and see `EBADF`), forgets
/// it, then closes it.
///
/// # Safety
///
/// Same contract as `close(2)`.
pub unsafe fn close(fd: c_int) -> c_int {
    let registry = FdRegistry::global();
    if registry.get(fd, false).is_some() {
        // Mark closed before waking waiters so their retry sees it.
        registry.del(fd);
        if is_hook_enabled() {
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all(fd);
            }
        }
    }
    (originals().close)(fd)
}

/// `F_SETFL`/`F_GETFL` on registered sockets keep the descriptor
/// non-blocking underneath while reporting the mode the application asked
/// for. Other commands pass `arg` through unchanged.
///
/// # Safety
///
/// Same contract as `fcntl(2)`; `arg` carries the integer or pointer
/// argument of `cmd`.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    let real = originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = socket_ctx(fd) {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
            real(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = real(fd, cmd);
            if flags < 0 {
                return flags;
            }
            match socket_ctx(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => real(fd, cmd, arg),
    }
}

/// `FIONBIO` on a registered socket is recorded as the user non-blocking
/// mode; the descriptor itself stays non-blocking.
///
/// # Safety
///
/// Same contract as `ioctl(2)`.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let real = originals().ioctl;
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(ctx) = socket_ctx(fd) {
            ctx.set_user_nonblock(*arg.cast::<c_int>() != 0);
            if ctx.sys_nonblock() {
                let mut on: c_int = 1;
                return real(fd, request, &mut on as *mut c_int);
            }
        }
    }
    real(fd, request, arg)
}

/// # Safety
///
/// Same contract as `getsockopt(2)`.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (originals().getsockopt)(sockfd, level, optname, optval, optlen)
}

/// Socket timeout in ms. Zero and negative values mean no timeout; a
/// sub-millisecond timeout rounds up to 1 ms.
fn timeval_ms(tv: &timeval) -> u64 {
    let (Ok(sec), Ok(usec)) = (u64::try_from(tv.tv_sec), u64::try_from(tv.tv_usec)) else {
        return NO_TIMEOUT;
    };
    match sec.saturating_mul(1000).saturating_add(usec.div_ceil(1000)) {
        0 => NO_TIMEOUT,
        ms => ms,
    }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are also recorded for the hooks; a zero
/// timeval means no timeout.
///
/// # Safety
///
/// Same contract as `setsockopt(2)`.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let rc = (originals().setsockopt)(sockfd, level, optname, optval, optlen);
    if rc == 0 && level == libc::SOL_SOCKET && !optval.is_null() && optlen as usize >= mem::size_of::<timeval>() {
        if let (Some(kind), Some(ctx)) = (TimeoutKind::from_optname(optname), FdRegistry::global().get(sockfd, false)) {
            ctx.set_timeout(kind, timeval_ms(&*optval.cast::<timeval>()));
        }
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Turns hooking on for the test thread and off again on drop.
    struct Hooked;

    impl Hooked {
        fn on() -> Self {
            set_hook_enabled(true);
            Hooked
        }
    }

    impl Drop for Hooked {
        fn drop(&mut self) {
            set_hook_enabled(false);
        }
    }

    fn tcp_socket() -> c_int {
        let fd = unsafe { socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    fn kernel_flags(fd: c_int) -> c_int {
        unsafe { (originals().fcntl)(fd, libc::F_GETFL) }
    }

    #[test]
    fn flag_is_per_thread() {
        assert!(!is_hook_enabled());
        let _hooked = Hooked::on();
        assert!(is_hook_enabled());
        std::thread::spawn(|| assert!(!is_hook_enabled())).join().unwrap();
    }

    #[test]
    fn unhooked_socket_is_not_registered() {
        let fd = tcp_socket();
        assert!(FdRegistry::global().get(fd, false).is_none());
        assert_eq!(kernel_flags(fd) & libc::O_NONBLOCK, 0);
        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn fcntl_reports_user_mode() {
        let _hooked = Hooked::on();
        let fd = tcp_socket();
        let ctx = FdRegistry::global().get(fd, false).unwrap();
        assert!(ctx.is_socket());
        assert_ne!(kernel_flags(fd) & libc::O_NONBLOCK, 0);

        let flags = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        assert_eq!(unsafe { fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as c_ulong) }, 0);
        assert!(ctx.user_nonblock());
        assert_ne!(unsafe { fcntl(fd, libc::F_GETFL, 0) } & libc::O_NONBLOCK, 0);

        assert_eq!(unsafe { fcntl(fd, libc::F_SETFL, flags as c_ulong) }, 0);
        assert!(!ctx.user_nonblock());
        assert_eq!(unsafe { fcntl(fd, libc::F_GETFL, 0) } & libc::O_NONBLOCK, 0);
        // Still non-blocking underneath.
        assert_ne!(kernel_flags(fd) & libc::O_NONBLOCK, 0);

        assert_eq!(unsafe { close(fd) }, 0);
        assert!(FdRegistry::global().get(fd, false).is_none());
    }

    #[test]
    fn fionbio_is_recorded() {
        let _hooked = Hooked::on();
        let fd = tcp_socket();
        let ctx = FdRegistry::global().get(fd, false).unwrap();

        let mut on: c_int = 1;
        assert_eq!(unsafe { ioctl(fd, libc::FIONBIO as c_ulong, (&mut on as *mut c_int).cast()) }, 0);
        assert!(ctx.user_nonblock());
        let mut off: c_int = 0;
        assert_eq!(unsafe { ioctl(fd, libc::FIONBIO as c_ulong, (&mut off as *mut c_int).cast()) }, 0);
        assert!(!ctx.user_nonblock());
        assert_ne!(kernel_flags(fd) & libc::O_NONBLOCK, 0);

        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn socket_timeouts_are_recorded() {
        let _hooked = Hooked::on();
        let fd = tcp_socket();
        let ctx = FdRegistry::global().get(fd, false).unwrap();

        let tv = timeval { tv_sec: 1, tv_usec: 500_000 };
        let len = mem::size_of::<timeval>() as socklen_t;
        let rc = unsafe { setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, (&tv as *const timeval).cast(), len) };
        assert_eq!(rc, 0);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        let zero = timeval { tv_sec: 0, tv_usec: 0 };
        let rc = unsafe { setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, (&zero as *const timeval).cast(), len) };
        assert_eq!(rc, 0);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);

        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn closed_context_reports_ebadf() {
        let _hooked = Hooked::on();
        let fd = tcp_socket();
        let ctx = FdRegistry::global().get(fd, false).unwrap();
        ctx.set_closed();

        let mut buf = [0u8; 4];
        let n = unsafe { read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EBADF);

        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn close_forgets_even_when_unhooked() {
        let fd = {
            let _hooked = Hooked::on();
            tcp_socket()
        };
        assert!(!is_hook_enabled());
        assert!(FdRegistry::global().get(fd, false).is_some());
        assert_eq!(unsafe { close(fd) }, 0);
        assert!(FdRegistry::global().get(fd, false).is_none());
    }

    #[test]
    fn unconnected_recv_fails_without_waiting() {
        let _hooked = Hooked::on();
        let fd = tcp_socket();
        let mut buf = [0u8; 4];
        // Unconnected TCP socket: the real call fails, nothing to wait for.
        let n = unsafe { recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        assert_eq!(n, -1);
        assert_ne!(errno(), libc::EAGAIN);
        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn sleep_falls_back_off_worker() {
        let _hooked = Hooked::on();
        let start = std::time::Instant::now();
        assert_eq!(unsafe { usleep(20_000) }, 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));

        let req = timespec { tv_sec: 0, tv_nsec: 5_000_000 };
        let mut rem = timespec { tv_sec: 9, tv_nsec: 9 };
        assert_eq!(unsafe { nanosleep(&req, &mut rem) }, 0);
    }

    #[test]
    fn timeval_conversion() {
        let ms = |tv_sec, tv_usec| timeval_ms(&timeval { tv_sec, tv_usec });
        assert_eq!(ms(2, 250_000), 2250);
        assert_eq!(ms(0, 1), 1);
        assert_eq!(ms(0, 0), NO_TIMEOUT);
        assert_eq!(ms(-1, 0), NO_TIMEOUT);
        assert_eq!(ms(3, -5), NO_TIMEOUT);
    }

    #[test]
    fn late_timeout_leaves_next_wait_alone() {
        let reactor = Reactor::new("late", crate::reactor::ReactorConfig::new()).unwrap();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);
        let fd = fds[0];

        // The previous wait woke on readiness before its timer got to run.
        let previous = TimerInfo::default();
        assert_eq!(previous.settle(), Ok(()));

        reactor.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert!(!expire_wait(&reactor, fd, Event::READ, &previous));
        assert_eq!(reactor.pending_events(), 1);

        let current = TimerInfo::default();
        assert!(expire_wait(&reactor, fd, Event::READ, &current));
        assert_eq!(reactor.pending_events(), 0);
        assert_eq!(current.settle(), Err(libc::ETIMEDOUT));

        unsafe {
            (originals().close)(fds[0]);
            (originals().close)(fds[1]);
        }
    }

    #[test]
    fn connect_timeout_is_settable() {
        set_connect_timeout(250);
        assert_eq!(connect_timeout(), 250);
        set_connect_timeout(NO_TIMEOUT);
        assert_eq!(connect_timeout(), NO_TIMEOUT);
    }
}
