//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended fiber.
///
/// `x[0..10]` hold x19..x28, `x[10]` the frame pointer and `x[11]` the
/// link register, which is where `switch_context` returns to.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,      // 0
    pub x: [u64; 12], // 8..104
    pub d: [u64; 8],  // 104..168, d8..d15
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable mapping that outlives
/// every switch into `ctx`.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context::default();
    ctx.sp = sp as u64;
    ctx.x[0] = entry as usize as u64; // x19
    ctx.x[1] = arg as u64; // x20
    ctx.x[11] = entry_trampoline as usize as u64; // lr
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #0x1");
}

/// Save callee-saved registers into `from` and resume `to`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must hold a context produced by
/// `init_context` or a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // from = x0
        "mov x9, sp",
        "str x9, [x0, #0]",
        "stp x19, x20, [x0, #8]",
        "stp x21, x22, [x0, #24]",
        "stp x23, x24, [x0, #40]",
        "stp x25, x26, [x0, #56]",
        "stp x27, x28, [x0, #72]",
        "stp x29, x30, [x0, #88]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // to = x1
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #8]",
        "ldp x21, x22, [x1, #24]",
        "ldp x23, x24, [x1, #40]",
        "ldp x25, x26, [x1, #56]",
        "ldp x27, x28, [x1, #72]",
        "ldp x29, x30, [x1, #88]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
