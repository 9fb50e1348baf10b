//! strand Echo Server
//!
//! One fiber accepts, one fiber per connection echoes. Every call below is
//! an ordinary blocking socket call routed through `strand::hook`, so a
//! fiber waiting on a slow peer costs a stack, not a thread.
//!
//! Usage:
//!     cargo build --release -p strand-echo
//!     ./target/release/echo [port] [idle_timeout_ms]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use libc::{c_int, sockaddr, sockaddr_in, socklen_t, timeval};
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand::{hook, spawn, Runtime, SchedulerConfig};
use tracing::{debug, error, info, warn};

const BUF_SIZE: usize = 4096;
const DEFAULT_PORT: u16 = 9999;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
}

fn listen(port: u16) -> io::Result<c_int> {
    unsafe {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: c_int = 1;
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&one as *const c_int).cast(),
            mem::size_of::<c_int>() as socklen_t,
        );

        let addr = sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be() },
            sin_zero: [0; 8],
        };
        let len = mem::size_of::<sockaddr_in>() as socklen_t;
        if libc::bind(fd, (&addr as *const sockaddr_in).cast::<sockaddr>(), len) != 0
            || libc::listen(fd, 128) != 0
        {
            let err = io::Error::last_os_error();
            hook::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

fn set_recv_timeout(fd: c_int, ms: u64) {
    let tv = timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    unsafe {
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&tv as *const timeval).cast(),
            mem::size_of::<timeval>() as socklen_t,
        );
    }
}

fn serve(fd: c_int, stats: Arc<Stats>) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = unsafe { hook::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n <= 0 {
            if n < 0 {
                debug!(fd, error = %io::Error::last_os_error(), "recv");
            }
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let w = unsafe { hook::send(fd, buf[sent..].as_ptr().cast(), n as usize - sent, 0) };
            if w <= 0 {
                debug!(fd, error = %io::Error::last_os_error(), "send");
                break;
            }
            sent += w as usize;
        }
        stats.bytes.fetch_add(sent as u64, Ordering::Relaxed);
        if sent < n as usize {
            break;
        }
    }
    unsafe { hook::close(fd) };
    stats.closes.fetch_add(1, Ordering::Relaxed);
}

fn accept_loop(listener: c_int, idle_timeout_ms: Option<u64>, stats: Arc<Stats>) {
    loop {
        let fd = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "accept failed");
            break;
        }
        let accepted = stats.accepts.fetch_add(1, Ordering::Relaxed) + 1;
        if accepted % 1000 == 0 {
            info!(
                accepted,
                closed = stats.closes.load(Ordering::Relaxed),
                bytes = stats.bytes.load(Ordering::Relaxed),
                "progress"
            );
        }
        if let Some(ms) = idle_timeout_ms {
            set_recv_timeout(fd, ms);
        }
        let stats = stats.clone();
        spawn(move || serve(fd, stats));
    }
    unsafe { hook::close(listener) };
}

fn main() -> strand::RuntimeResult<()> {
    strand::init_logging();

    let mut args = std::env::args().skip(1);
    let port = args.next().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT);
    let idle_timeout_ms = args.next().and_then(|s| s.parse().ok());

    let runtime = Runtime::new(SchedulerConfig::from_env().name("echo"))?;
    let stats = Arc::new(Stats::default());

    runtime.block_on(move || {
        spawn(move || match listen(port) {
            Ok(listener) => {
                info!(port, ?idle_timeout_ms, "listening");
                accept_loop(listener, idle_timeout_ms, stats);
            }
            Err(err) => warn!(port, %err, "cannot listen"),
        });
    });
    Ok(())
}
