//! C symbols with libc names, forwarding to [`hook`](crate::hook).
//!
//! Linking a binary with the `interpose` feature makes every call to these
//! functions, including those made by `std` and other libraries, go
//! through the hooks. The originals stay reachable through
//! `dlsym(RTLD_NEXT, ..)`.
//!
//! `fcntl` and `ioctl` are variadic in C. They are exported with one
//! word-sized trailing argument, which is where the x86_64 and aarch64
//! Linux calling conventions place the first variadic argument.

use crate::hook;
use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    hook::sleep(seconds)
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    hook::usleep(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    hook::nanosleep(req, rem)
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    hook::socket(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    hook::connect(fd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    hook::accept(fd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    hook::read(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    hook::readv(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    hook::recv(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    hook::recvfrom(fd, buf, len, flags, src_addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    hook::recvmsg(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    hook::write(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    hook::writev(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    hook::send(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    hook::sendto(fd, buf, len, flags, dest_addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    hook::sendmsg(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    hook::close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    hook::fcntl(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    hook::ioctl(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    hook::getsockopt(fd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    hook::setsockopt(fd, level, optname, optval, optlen)
}
