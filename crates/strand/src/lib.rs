//! # strand - stackful fibers over an epoll reactor
//!
//! A userspace M:N concurrency runtime that turns ordinary blocking I/O
//! code into non-blocking, cooperatively-scheduled work. Three pieces fit
//! together:
//!
//! - **Fibers**: stackful coroutines with explicit resume/yield
//!   (`READY -> RUNNING -> TERM`), 128 KiB stacks with guard pages.
//! - **Scheduler**: a worker-thread pool draining a shared FIFO of fibers
//!   and callbacks, with optional per-task thread pinning and optional
//!   adoption of the calling thread.
//! - **Reactor** ([`IoManager`]): the scheduler whose idle fibers block
//!   in epoll. Hooked blocking calls park the calling fiber until the fd
//!   is ready or a deadline fires; timers ride the same wait loop.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{fd_manager, hook, IoManager};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "app").unwrap();
//!
//!     // A connected socket from elsewhere (accept, socketpair, ...)
//!     // joins the runtime through the fd registry.
//!     let fd = make_connected_socket();
//!     fd_manager().get(fd, true);
//!
//!     iom.schedule_call(move || {
//!         // Runs inside a fiber on a reactor worker; hooks are on, so
//!         // these park the fiber, not the OS thread.
//!         hook::usleep(10_000);
//!
//!         let mut buf = [0u8; 512];
//!         let n = hook::recv(fd, &mut buf, 0);
//!         if n > 0 {
//!             hook::send(fd, &buf[..n as usize], 0);
//!         }
//!         hook::close(fd);
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   hooked call (recv, send, sleep, ...)
//!        │  would block?
//!        ▼
//!   FdManager ──► IoManager::add_event(fd, READ|WRITE) ─┐
//!        │                + optional condition timer     │
//!        ▼                                               ▼
//!   Fiber::yield ◄──────────────── worker resumes ◄── idle fiber in
//!   (worker freed)                 via scheduler       epoll_wait
//! ```

// Core types
pub use strand_core::{
    env_get, env_get_bool, env_get_opt, set_flush_enabled, set_log_level, EventError, LogLevel,
    SchedError, SchedResult,
};

// Log macros are exported at the strand-core crate root
pub use strand_core::{sdebug, serror, sinfo, strace, swarn};

// Runtime
pub use strand_runtime::{
    fiber::{current_id, yield_now},
    Fiber, FiberState, FrontNotify, RuntimeConfig, ScheduleTask, Scheduler, SchedulerHooks,
    TaskKind, Timer, TimerCallback, TimerManager, DEFAULT_STACK_SIZE,
};

// I/O
pub use strand_io::{
    fd_manager, hook, is_hook_enable, set_hook_enable, Event, FdCtx, FdManager, IoManager,
    Poller, TimeoutKind, TIMEOUT_NONE,
};

pub mod thread {
    //! Thread helpers re-exported from the runtime
    pub use strand_runtime::thread::{current_tid, name, set_name, Semaphore, Thread};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_facade_end_to_end() {
        let iom = IoManager::new(2, false, "facade").unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        iom.schedule_call(move || {
            assert!(is_hook_enable());
            assert_ne!(current_id(), u64::MAX);
            hook::usleep(5_000);
            d.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        iom.stop();
    }
}
