//! aarch64 context switching
//!
//! Same contract as the x86_64 backend. AAPCS64 callee-saved set:
//! x19-x28, fp (x29), lr (x30), sp, and the low halves of v8-v15.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended fiber (AAPCS64)
///
/// Field order is the assembly offset table; do not reorder.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub sp: u64,  // 0x00
    pub lr: u64,  // 0x08  resume address
    pub x19: u64, // 0x10
    pub x20: u64, // 0x18
    pub x21: u64, // 0x20
    pub x22: u64, // 0x28
    pub x23: u64, // 0x30
    pub x24: u64, // 0x38
    pub x25: u64, // 0x40
    pub x26: u64, // 0x48
    pub x27: u64, // 0x50
    pub x28: u64, // 0x58
    pub fp: u64,  // 0x60
    pub d8: u64,  // 0x68
    pub d9: u64,  // 0x70
    pub d10: u64, // 0x78
    pub d11: u64, // 0x80
    pub d12: u64, // 0x88
    pub d13: u64, // 0x90
    pub d14: u64, // 0x98
    pub d15: u64, // 0xA0
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            lr: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            d8: 0,
            d9: 0,
            d10: 0,
            d11: 0,
            d12: 0,
            d13: 0,
            d14: 0,
            d15: 0,
        }
    }
}

/// Arm a fresh context
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// high end of a live stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // sp must stay 16-byte aligned at all times on aarch64.
    let aligned_sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::zeroed();
    ctx.sp = aligned_sp as u64;
    ctx.lr = fiber_entry_trampoline as usize as u64;
    ctx.x19 = entry_fn as u64;
    ctx.x20 = entry_arg as u64;
}

/// Trampoline that calls the entry function with its argument
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {returned}",
        "brk #1",
        returned = sym entry_returned,
    );
}

/// Save callee-saved registers into `old`, restore `new`, continue there
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (x0); lr is the resume address
        "mov x2, sp",
        "str x2, [x0, 0x00]",
        "str x30, [x0, 0x08]",
        "stp x19, x20, [x0, 0x10]",
        "stp x21, x22, [x0, 0x20]",
        "stp x23, x24, [x0, 0x30]",
        "stp x25, x26, [x0, 0x40]",
        "stp x27, x28, [x0, 0x50]",
        "str x29, [x0, 0x60]",
        "stp d8, d9, [x0, 0x68]",
        "stp d10, d11, [x0, 0x78]",
        "stp d12, d13, [x0, 0x88]",
        "stp d14, d15, [x0, 0x98]",
        // Restore from new (x1)
        "ldr x2, [x1, 0x00]",
        "mov sp, x2",
        "ldr x30, [x1, 0x08]",
        "ldp x19, x20, [x1, 0x10]",
        "ldp x21, x22, [x1, 0x20]",
        "ldp x23, x24, [x1, 0x30]",
        "ldp x25, x26, [x1, 0x40]",
        "ldp x27, x28, [x1, 0x50]",
        "ldr x29, [x1, 0x60]",
        "ldp d8, d9, [x1, 0x68]",
        "ldp d10, d11, [x1, 0x78]",
        "ldp d12, d13, [x1, 0x88]",
        "ldp d14, d15, [x1, 0x98]",
        "ret",
    );
}

extern "C" fn entry_returned() {
    std::process::abort();
}
