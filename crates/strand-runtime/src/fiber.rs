//! Stackful fibers
//!
//! A fiber is a cooperatively-scheduled coroutine with its own stack and
//! saved register context. State machine: `READY -> RUNNING -> TERM`,
//! with `reset()` re-arming a TERM fiber back to READY on the same stack.
//!
//! Each OS thread lazily gets a *main fiber* representing its native
//! stack. A worker fiber created with `run_in_scheduler = true` switches
//! against the thread's scheduler fiber on resume/yield; with `false` it
//! switches against the main fiber.
//!
//! Ownership: a fiber stays alive through `Arc` handles held by whoever
//! scheduled it. While running, the entry trampoline holds one more
//! handle so the object survives even if the scheduling side drops its
//! reference mid-run; that handle is released just before the terminal
//! yield so the destructor runs on the scheduling side, never on the
//! fiber's own stack.

use crate::arch::{self, Context};
use crate::stack::Stack;
use crate::tls;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Default fiber stack: 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Fiber lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Armed and waiting to be resumed
    Ready = 0,
    /// Executing on some thread's stack
    Running = 1,
    /// Entry callback returned; reusable via `reset()`
    Term = 2,
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

type EntryFn = Box<dyn FnOnce() + Send>;

/// A stackful coroutine
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Saved register context; written only by the switch discipline
    ctx: UnsafeCell<Context>,
    /// Owned stack; `None` for a thread's main fiber
    stack: Option<Stack>,
    /// Entry callback, consumed on first run
    entry: UnsafeCell<Option<EntryFn>>,
    /// Yield/resume against the scheduler fiber instead of the main fiber
    run_in_scheduler: bool,
    /// Serializes resume attempts from the dispatch loop
    exec_lock: Mutex<()>,
    self_ref: Weak<Fiber>,
}

// A fiber executes on exactly one thread at a time: `ctx` and `entry` are
// only touched by the resume/yield discipline (exec_lock + state machine),
// never concurrently.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a worker fiber in `READY` state
    ///
    /// `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`].
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        // Stack or context failure means the OS is broken underneath us.
        let stack = match Stack::new(size) {
            Ok(s) => s,
            Err(e) => panic!("fiber stack allocation failed: {}", e),
        };
        let stack_top = stack.top();

        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Ready as u8),
            ctx: UnsafeCell::new(Context::zeroed()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(Box::new(entry))),
            run_in_scheduler,
            exec_lock: Mutex::new(()),
            self_ref: weak.clone(),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                stack_top,
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        fiber
    }

    /// The fiber running on this thread
    ///
    /// On first call from a bare OS thread this installs the thread's main
    /// fiber (state `RUNNING`, no owned stack) and returns it.
    pub fn current() -> Arc<Fiber> {
        let cur = tls::current();
        if !cur.is_null() {
            let f = unsafe { &*cur };
            return f
                .self_ref
                .upgrade()
                .expect("running fiber dropped while current");
        }

        let main = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: UnsafeCell::new(Context::zeroed()),
            stack: None,
            entry: UnsafeCell::new(None),
            run_in_scheduler: false,
            exec_lock: Mutex::new(()),
            self_ref: weak.clone(),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        tls::set_current(Arc::as_ptr(&main));
        if tls::scheduler().is_null() {
            tls::set_scheduler(Arc::as_ptr(&main));
        }
        tls::set_main(main.clone());
        main
    }

    /// Install `f` as this thread's scheduler fiber
    ///
    /// Yields of `run_in_scheduler` fibers on this thread will switch into
    /// it from now on. The caller keeps the owning handle.
    pub fn set_scheduler_fiber(f: &Arc<Fiber>) {
        tls::set_scheduler(Arc::as_ptr(f));
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Live fibers in the process (main fibers included)
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub(crate) fn exec_lock(&self) -> &Mutex<()> {
        &self.exec_lock
    }

    /// Switch from this thread's current context into the fiber
    ///
    /// Requires `READY`. Control comes back when the fiber yields or
    /// terminates.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume() requires a READY fiber"
        );
        // Make sure the thread has a main fiber to return to.
        if !tls::has_main() {
            Fiber::current();
        }

        let target = if self.run_in_scheduler {
            tls::scheduler()
        } else {
            tls::main_ptr()
        };
        assert!(!target.is_null(), "resume() with no return fiber installed");

        self.set_state(FiberState::Running);
        tls::set_current(self as *const Fiber);
        unsafe {
            let from = (*target).ctx.get();
            arch::context_switch(from, self.ctx.get());
        }
        // Back here when the fiber yields or terminates.
    }

    /// Suspend this fiber and switch back to its return fiber
    ///
    /// Requires `RUNNING` or `TERM`; a non-TERM fiber re-arms to `READY`.
    /// Whoever holds a handle may `resume()` it again later; yield itself
    /// never re-queues.
    pub fn yield_fiber(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield on a {:?} fiber",
            state
        );
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let target = if self.run_in_scheduler {
            tls::scheduler()
        } else {
            tls::main_ptr()
        };
        assert!(!target.is_null(), "yield with no return fiber installed");

        tls::set_current(target);
        unsafe {
            arch::context_switch(self.ctx.get(), (*target).ctx.get());
        }
        // Back here when somebody resumes us.
    }

    /// Re-arm a finished fiber with a new entry, reusing its stack
    ///
    /// Requires `TERM` and an owned stack (main fibers cannot be reset).
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset() requires a TERM fiber"
        );
        let stack = self
            .stack
            .as_ref()
            .expect("reset() requires an owned stack");

        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Entry trampoline target: runs the user callback, then terminates
///
/// Holds an owned handle across the user call so the fiber object outlives
/// any mid-run drop by the scheduling side; releases it before the
/// terminal yield. That yield never returns.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let handle = fiber
        .self_ref
        .upgrade()
        .expect("fiber dropped before first resume");

    let entry = unsafe { (*handle.entry.get()).take() };
    if let Some(entry) = entry {
        entry();
    }

    handle.set_state(FiberState::Term);
    let raw = Arc::as_ptr(&handle);
    drop(handle);

    unsafe { (*raw).yield_fiber() };
    unreachable!("terminated fiber was resumed");
}

/// Yield the running fiber; on a bare thread, yields the OS thread
pub fn yield_now() {
    let cur = tls::current();
    if cur.is_null() || !tls::in_fiber() {
        std::thread::yield_now();
        return;
    }
    unsafe { (*cur).yield_fiber() };
}

/// Id of the running fiber, or `u64::MAX` outside any fiber
pub fn current_id() -> u64 {
    let cur = tls::current();
    if cur.is_null() {
        return u64::MAX;
    }
    unsafe { (*cur).id() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_main_fiber_install() {
        let main = Fiber::current();
        assert_eq!(main.state(), FiberState::Running);
        assert!(main.stack.is_none());
        // Stable across calls on the same thread
        let again = Fiber::current();
        assert_eq!(main.id(), again.id());
    }

    #[test]
    fn test_resume_runs_entry_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_and_resume_interleave() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.lock().unwrap().push("a");
                yield_now();
                s.lock().unwrap().push("b");
            },
            0,
            false,
        );

        fiber.resume();
        steps.lock().unwrap().push("between");
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        assert_eq!(&*steps.lock().unwrap(), &["a", "between", "b"]);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let s = seen.clone();
        let fiber = Fiber::new(
            move || {
                s.store(Fiber::current().id(), Ordering::SeqCst);
            },
            0,
            false,
        );
        let id = fiber.id();
        fiber.resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }

    #[test]
    fn test_ids_monotonic() {
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert!(b.id() > a.id());
        // Drain them so the count stays balanced
        a.resume();
        b.resume();
    }
}
