//! Named OS threads with synchronous startup handoff
//!
//! `Thread::new` does not return until the child has installed its TLS
//! name and published its kernel tid, so the parent can observe a fully
//! started worker.

use strand_core::error::{SchedError, SchedResult};

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Counting semaphore over Mutex + Condvar
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Kernel thread id of the calling thread
#[inline]
pub fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Name recorded for the calling thread
pub fn name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

pub fn set_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// An OS thread owned by the scheduler
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: i32,
    name: String,
}

impl Thread {
    /// Spawn a named thread running `cb`; returns once the child has
    /// started and its tid is known
    pub fn new<F>(name: &str, cb: F) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(-1));

        let child_sem = sem.clone();
        let child_tid = tid_slot.clone();
        let child_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                set_name(&child_name);
                child_tid.store(current_tid(), Ordering::Release);
                child_sem.post();
                cb();
            })
            .map_err(|e| SchedError::ThreadSpawn(e.raw_os_error().unwrap_or(0)))?;

        sem.wait();

        Ok(Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // A joined thread has an empty handle; an unjoined one is detached.
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
    }
}
