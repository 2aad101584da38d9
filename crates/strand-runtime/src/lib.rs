//! # strand-runtime
//!
//! The cooperative core of the strand runtime:
//!
//! - Stackful fibers with explicit resume/yield (`fiber`)
//! - Architecture-specific context switching (`arch`)
//! - mmap'd fiber stacks with guard pages (`stack`)
//! - Named threads with synchronous startup handoff (`thread`)
//! - The pool scheduler and its reactor hook seam (`scheduler`)
//! - Absolute-deadline timers (`timer`)

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

pub use config::RuntimeConfig;
pub use fiber::{yield_now, Fiber, FiberState, DEFAULT_STACK_SIZE};
pub use scheduler::{ScheduleTask, Scheduler, SchedulerHooks, TaskKind};
pub use timer::{FrontNotify, Timer, TimerCallback, TimerManager};
