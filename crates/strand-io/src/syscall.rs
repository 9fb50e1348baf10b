//! Original libc entry points
//!
//! Every hook falls back to the real call. The real calls are resolved once
//! per process with `dlsym(RTLD_NEXT, ..)`, which skips any definition in
//! this object (see the `interpose` feature) and lands in libc.
//!
//! A symbol that cannot be resolved is fatal: nothing sensible can run
//! without `read` or `close`.

use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};
use std::ffi::CStr;
use std::mem;
use std::sync::OnceLock;
use tracing::error;

macro_rules! originals {
    ($($name:ident: $ty:ty;)*) => {
        /// Function pointers to the unhooked libc calls.
        #[derive(Clone, Copy)]
        pub struct Originals {
            $(pub $name: $ty,)*
        }

        fn resolve() -> Originals {
            Originals {
                $($name: unsafe { lookup::<$ty>(concat!(stringify!($name), "\0")) },)*
            }
        }
    };
}

originals! {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint;
    usleep: unsafe extern "C" fn(useconds_t) -> c_int;
    nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
    readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    recvfrom: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
    recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
    writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    sendto: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
    sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
    close: unsafe extern "C" fn(c_int) -> c_int;
    fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
    ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
}

static ORIGINALS: OnceLock<Originals> = OnceLock::new();

/// The process-wide table, resolved on first use.
#[inline]
pub fn originals() -> &'static Originals {
    ORIGINALS.get_or_init(resolve)
}

/// Resolve `name` (NUL-terminated) to a function pointer of type `T`.
///
/// # Safety
///
/// `T` must be the correct function pointer type for the symbol.
unsafe fn lookup<T: Copy>(name: &'static str) -> T {
    assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());
    let cname = CStr::from_bytes_with_nul(name.as_bytes()).unwrap_or_default();
    let sym = libc::dlsym(libc::RTLD_NEXT, cname.as_ptr());
    if sym.is_null() {
        error!(symbol = %cname.to_string_lossy(), "dlsym(RTLD_NEXT) failed");
        panic!("cannot resolve original `{}`", cname.to_string_lossy());
    }
    mem::transmute_copy::<*mut c_void, T>(&sym)
}
