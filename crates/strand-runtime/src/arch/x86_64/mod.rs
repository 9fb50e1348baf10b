//! x86_64 context switching (System V ABI)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended fiber.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable mapping that outlives
/// every switch into `ctx`.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp`, so it sees rsp exactly as stored.
    // Keep it 16-byte aligned; the `call` inside pushes the return address
    // and the entry function then observes the usual rsp % 16 == 8.
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..Context::default()
    };
}

/// First code a fresh fiber executes.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // The entry function switches away for good; getting here is a bug.
        "ud2",
    );
}

/// Save callee-saved registers into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must hold a context produced by
/// `init_context` or a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // from = rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // to = rsi
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}
