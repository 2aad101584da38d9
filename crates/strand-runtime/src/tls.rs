//! Thread-local fiber state
//!
//! Exactly three slots per OS thread:
//!
//! - the currently-running fiber (raw pointer, kept alive by whoever
//!   resumed it),
//! - the owned handle to the thread's main fiber,
//! - the scheduler fiber (raw pointer, owned by the scheduler) that
//!   `run_in_scheduler` fibers switch against.
//!
//! All three are updated strictly before the target fiber's user code can
//! observe them.

use crate::fiber::Fiber;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    /// Fiber currently executing on this thread's stack
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Owned handle to this thread's main fiber (created on first touch)
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber that `run_in_scheduler` yields return to
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
}

#[inline]
pub(crate) fn set_current(f: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(f));
}

#[inline]
pub(crate) fn current() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

pub(crate) fn set_main(f: Arc<Fiber>) {
    MAIN_FIBER.with(|cell| *cell.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn main_ptr() -> *const Fiber {
    MAIN_FIBER.with(|cell| {
        cell.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |f| Arc::as_ptr(f))
    })
}

#[inline]
pub(crate) fn has_main() -> bool {
    MAIN_FIBER.with(|cell| cell.borrow().is_some())
}

#[inline]
pub(crate) fn set_scheduler(f: *const Fiber) {
    SCHEDULER_FIBER.with(|cell| cell.set(f));
}

#[inline]
pub(crate) fn scheduler() -> *const Fiber {
    SCHEDULER_FIBER.with(|cell| cell.get())
}

/// Check if this thread is currently executing inside a worker fiber
///
/// False on a bare thread and on a thread that is sitting in its main
/// fiber or scheduler fiber.
#[inline]
pub fn in_fiber() -> bool {
    let cur = current();
    !cur.is_null() && cur != main_ptr() && cur != scheduler()
}
