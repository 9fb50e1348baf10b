//! Architecture-specific context switching
//!
//! Each backend provides the same three items:
//!
//! - `Context`: callee-saved register file of a suspended fiber
//! - `init_context`: prepare a fresh context that enters `entry(arg)` on a new stack
//! - `switch_context`: save the running registers into one context and load another
//!
//! The entry function never returns; it must switch away for the last time
//! itself (see `fiber::fiber_entry`).

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("strand-runtime supports x86_64 and aarch64 only");
    }
}

/// Signature of the function a fresh context starts in.
pub type EntryFn = extern "C" fn(usize);
