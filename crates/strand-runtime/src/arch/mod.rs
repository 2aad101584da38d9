//! Architecture-specific context switching
//!
//! Each backend exposes the same contract:
//!
//! - `Context` - the callee-saved register block a suspended fiber keeps
//! - `init_context(ctx, stack_top, entry_fn, entry_arg)` - arm a fresh
//!   context so the first switch into it calls `entry_fn(entry_arg)` on
//!   the given stack
//! - `context_switch(old, new)` - save the running state into `old`,
//!   restore `new`, and continue there
//!
//! Everything above this module is architecture-independent.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use x86_64 as current;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use aarch64 as current;
    } else {
        compile_error!("unsupported architecture: strand needs x86_64 or aarch64");
    }
}

pub use current::{context_switch, init_context, Context};
