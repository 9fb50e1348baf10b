//! Fiber stacks backed by anonymous mmap
//!
//! Layout (addresses grow to the right):
//!
//! ```text
//! base                  base + page                       base + len
//! | guard (PROT_NONE)   | usable stack (READ|WRITE)  ...  | <- top
//! ```
//!
//! Stacks grow down, so overflowing runs into the guard page and faults
//! instead of silently corrupting a neighbour. Mapping uses MAP_NORESERVE:
//! physical pages are only committed as the fiber touches them.

use std::ptr::NonNull;
use std::sync::OnceLock;
use strand_core::constants::MIN_STACK_SIZE;
use strand_core::StackError;

/// An owned, guarded stack mapping.
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

// The mapping is plain memory owned by exactly one fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

fn errno() -> i32 {
    nix::errno::Errno::last() as i32
}

impl Stack {
    /// Map a stack with at least `size` usable bytes plus one guard page.
    pub fn new(size: usize) -> Result<Stack, StackError> {
        let page = page_size();
        let usable = size
            .max(MIN_STACK_SIZE)
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(StackError::TooLarge(size))?;
        let len = usable.checked_add(page).ok_or(StackError::TooLarge(size))?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::MapFailed { size: len, errno: errno() });
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = errno();
            unsafe { libc::munmap(base, len) };
            return Err(StackError::GuardFailed(err));
        }

        // mmap never returns null on success
        let base = NonNull::new(base as *mut u8).ok_or(StackError::MapFailed { size: len, errno: 0 })?;
        Ok(Stack { base, len, guard: page })
    }

    /// One past the highest usable byte; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable bytes (excludes the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Lowest writable address.
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::error!(errno = errno(), len = self.len, "munmap of fiber stack failed");
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("limit", &self.limit())
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_pages_and_minimum() {
        let page = page_size();
        let s = Stack::new(1).unwrap();
        assert!(s.size() >= MIN_STACK_SIZE);
        assert_eq!(s.size() % page, 0);

        let s = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(s.size(), (MIN_STACK_SIZE + page) & !(page - 1));
    }

    #[test]
    fn usable_range_is_writable() {
        let s = Stack::new(64 * 1024).unwrap();
        unsafe {
            *s.limit() = 0xAB;
            *s.top().sub(1) = 0xCD;
            assert_eq!(*s.limit(), 0xAB);
            assert_eq!(*s.top().sub(1), 0xCD);
        }
        assert_eq!(s.top() as usize - s.limit() as usize, s.size());
    }

    #[test]
    fn absurd_size_is_an_error() {
        assert!(matches!(Stack::new(usize::MAX), Err(StackError::TooLarge(_))));
    }
}
