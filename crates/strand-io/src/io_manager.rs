//! I/O reactor
//!
//! `IoManager` specializes the scheduler: each worker's idle fiber blocks
//! in the poller instead of napping, and ready events plus expired timers
//! are drained into the scheduler queue from there. `trigger_event` is the
//! only bridge from reactor to scheduler; user code never runs inline on
//! the reactor path.
//!
//! Per fd, the reactor keeps one `FdContext` with independent read/write
//! slots. A slot holds whoever is waiting (a fiber or a callback) and the
//! scheduler to hand it back to; the fd's mutex serializes registration,
//! cancellation and triggering, so a readiness/timeout race resolves to
//! whichever side clears the event bit first - the loser sees the bit gone
//! and does nothing.

use crate::hook;
use crate::poller::{Event, Poller};

use strand_core::error::{EventError, SchedError, SchedResult};
use strand_core::{sdebug, serror, swarn};
use strand_runtime::fiber::{self, Fiber, FiberState};
use strand_runtime::scheduler::{ScheduleTask, Scheduler, SchedulerHooks};
use strand_runtime::thread;
use strand_runtime::timer::{FrontNotify, Timer, TimerCallback, TimerManager};
use strand_runtime::RuntimeConfig;

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Who gets dispatched when an event fires
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// One armed event slot: where to resume, and on which thread
pub(crate) struct EventContext {
    scheduler: Weak<Scheduler>,
    waiter: Waiter,
    thread: i32,
}

struct FdContextInner {
    /// Registered interest; a bit is set exactly when its slot is armed
    events: Event,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

/// Reactor-owned per-fd state
pub(crate) struct FdContext {
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new() -> FdContext {
        FdContext {
            inner: Mutex::new(FdContextInner {
                events: Event::empty(),
                read: None,
                write: None,
            }),
        }
    }
}

fn slot_for(inner: &mut FdContextInner, event: Event) -> &mut Option<EventContext> {
    if event == Event::READ {
        &mut inner.read
    } else if event == Event::WRITE {
        &mut inner.write
    } else {
        unreachable!("event slots exist only for READ and WRITE")
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

thread_local! {
    static CURRENT_IOM: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// The I/O-aware scheduler
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    poller: Poller,
    /// Wake pipe; one byte in, edge-triggered burst read out
    tickle_fds: [i32; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Armed event bits across all fds
    pending_events: AtomicUsize,
    config: RuntimeConfig,
    self_ref: Weak<IoManager>,
}

impl IoManager {
    /// Build and start a reactor with env-derived configuration
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<IoManager>> {
        Self::with_config(threads, use_caller, name, RuntimeConfig::from_env())
    }

    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> SchedResult<Arc<IoManager>> {
        let sched = Scheduler::new(threads, use_caller, name);
        sched.set_stack_size(config.stack_size);

        let poller = Poller::new().map_err(SchedError::Os)?;

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(SchedError::Os(errno()));
        }
        // Edge-triggered read end must never block the drain loop
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let fd_capacity = config.fd_table_capacity;
        let iom = Arc::new_cyclic(|weak| IoManager {
            sched,
            timers: TimerManager::new(),
            poller,
            tickle_fds: fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
            config,
            self_ref: weak.clone(),
        });

        iom.poller
            .add(fds[0], Event::READ, fds[0] as u64)
            .map_err(SchedError::Os)?;

        let hooks: Weak<dyn SchedulerHooks> = iom.self_ref.clone();
        iom.sched.set_hooks(hooks);
        let notify: Weak<dyn FrontNotify> = iom.self_ref.clone();
        iom.timers.set_notify(notify);

        let _ = iom.fd_context(fd_capacity as i32 - 1, true);
        iom.install_tls();
        iom.sched.start()?;

        Ok(iom)
    }

    /// Reactor registered for the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    fn install_tls(&self) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(self.self_ref.clone()));
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Armed event bits across all fds
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    // -- scheduling / timer conveniences ---------------------------------

    pub fn schedule(&self, task: ScheduleTask) {
        self.sched.schedule(task);
    }

    pub fn schedule_fiber(&self, f: Arc<Fiber>, thread: i32) {
        self.sched.schedule_fiber(f, thread);
    }

    pub fn schedule_call<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule_call(cb);
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Stop the scheduler and join the workers
    ///
    /// Waits until queued tasks, armed events and timers are drained; the
    /// `use_caller` threading preconditions of [`Scheduler::stop`] apply.
    pub fn stop(&self) {
        self.sched.stop();
    }

    // -- fd context table -------------------------------------------------

    fn fd_context(&self, fd: i32, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read().unwrap();
            if idx < table.len() {
                return Some(table[idx].clone());
            }
        }
        if !create {
            return None;
        }
        let mut table = self.fd_contexts.write().unwrap();
        if idx >= table.len() {
            let new_len = std::cmp::max(idx + 1, table.len() * 3 / 2);
            table.resize_with(new_len, || Arc::new(FdContext::new()));
        }
        Some(table[idx].clone())
    }

    // -- event registration -----------------------------------------------

    /// Arm `event` on `fd`
    ///
    /// With a callback the slot keeps it; otherwise the currently-running
    /// fiber becomes the continuation. Registering an already-armed event
    /// is refused - `del_event` first.
    pub fn add_event(
        &self,
        fd: i32,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), EventError> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one of READ/WRITE"
        );
        let ctx = match self.fd_context(fd, true) {
            Some(ctx) => ctx,
            None => return Err(EventError::Poller(libc::EBADF)),
        };

        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.contains(event) {
            swarn!(
                "{}: duplicate add_event({}, {:?})",
                self.sched.name(),
                fd,
                event
            );
            return Err(EventError::Duplicate);
        }

        let new_events = inner.events | event;
        let res = if inner.events.is_empty() {
            self.poller.add(fd, new_events, fd as u64)
        } else {
            self.poller.modify(fd, new_events, fd as u64)
        };
        if let Err(e) = res {
            serror!("add_event: poller update failed for fd {}: errno {}", fd, e);
            return Err(EventError::Poller(e));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events = new_events;

        let waiter = match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let f = Fiber::current();
                assert_eq!(
                    f.state(),
                    FiberState::Running,
                    "waiting fiber must be RUNNING"
                );
                Waiter::Fiber(f)
            }
        };
        let slot = slot_for(&mut inner, event);
        debug_assert!(slot.is_none(), "armed bit without a slot");
        *slot = Some(EventContext {
            scheduler: Arc::downgrade(&self.sched),
            waiter,
            thread: -1,
        });
        Ok(())
    }

    /// Disarm `event` on `fd` without waking the waiter
    pub fn del_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        let res = if left.is_empty() {
            self.poller.remove(fd)
        } else {
            self.poller.modify(fd, left, fd as u64)
        };
        if let Err(e) = res {
            swarn!("del_event: poller update failed for fd {}: errno {}", fd, e);
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *slot_for(&mut inner, event) = None;
        true
    }

    /// Disarm `event` on `fd` and wake the waiter anyway
    ///
    /// The resumed side learns of the cancellation through its own state
    /// (typically a timed-out witness), not through the event.
    pub fn cancel_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        let res = if left.is_empty() {
            self.poller.remove(fd)
        } else {
            self.poller.modify(fd, left, fd as u64)
        };
        if let Err(e) = res {
            swarn!(
                "cancel_event: poller update failed for fd {}: errno {}",
                fd,
                e
            );
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        self.trigger_event(&mut inner, event);
        true
    }

    /// Disarm everything on `fd`, waking both waiters
    pub fn cancel_all(&self, fd: i32) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(e) = self.poller.remove(fd) {
            swarn!("cancel_all: poller remove failed for fd {}: errno {}", fd, e);
        }

        if inner.events.contains(Event::READ) {
            self.trigger_event(&mut inner, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(Event::WRITE) {
            self.trigger_event(&mut inner, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// The sole reactor-to-scheduler bridge: clear the bit, hand the
    /// waiter to the scheduler, reset the slot (fd mutex held by caller)
    fn trigger_event(&self, inner: &mut FdContextInner, event: Event) {
        debug_assert!(inner.events.contains(event));
        inner.events &= !event;

        let slot = slot_for(inner, event);
        if let Some(ec) = slot.take() {
            if let Some(sched) = ec.scheduler.upgrade() {
                match ec.waiter {
                    Waiter::Fiber(f) => sched.schedule_fiber(f, ec.thread),
                    Waiter::Call(cb) => sched.schedule(ScheduleTask::call(cb, ec.thread)),
                }
            }
        }
    }

    // -- wake + idle -------------------------------------------------------

    /// One byte into the wake pipe, but only when somebody is parked
    fn wake_idle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let n = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        // A full pipe already has enough wakes queued.
        let _ = n;
    }

    fn reactor_stopping(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
            && self.sched.base_stopping()
    }

    /// Idle fiber body: block in the poller, drain timers and events into
    /// the scheduler, yield, repeat
    fn run_idle(&self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.config.max_poll_events];
        let mut expired: Vec<TimerCallback> = Vec::new();

        loop {
            if self.reactor_stopping() {
                sdebug!(
                    "{}: idle exits in thread {}",
                    self.sched.name(),
                    thread::current_tid()
                );
                break;
            }

            let n = loop {
                let timeout = std::cmp::min(
                    self.timers.next_timeout_ms(),
                    self.config.max_poll_timeout_ms,
                ) as i32;
                match self.poller.wait(&mut events, timeout) {
                    Ok(n) => break n,
                    Err(e) if e == libc::EINTR => continue,
                    Err(e) => panic!("poller wait failed: errno {}", e),
                }
            };

            self.timers.collect_expired(&mut expired);
            for cb in expired.drain(..) {
                self.sched.schedule_call(move || cb());
            }

            for ev in events[..n].iter() {
                let data_fd = ev.u64 as i32;

                if data_fd == self.tickle_fds[0] {
                    // Edge-triggered: exhaust the pipe in one burst
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let Some(ctx) = self.fd_context(data_fd, false) else {
                    continue;
                };
                let mut inner = ctx.inner.lock().unwrap();

                // Error/hangup becomes readable+writable, restricted to
                // what is actually registered.
                let mut ep = ev.events;
                if ep & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    ep |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.to_epoll();
                }
                let mut real = Event::empty();
                if ep & libc::EPOLLIN as u32 != 0 {
                    real |= Event::READ;
                }
                if ep & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::WRITE;
                }
                real &= inner.events;
                if real.is_empty() {
                    continue;
                }

                let left = inner.events & !real;
                let res = if left.is_empty() {
                    self.poller.remove(data_fd)
                } else {
                    self.poller.modify(data_fd, left, ev.u64)
                };
                if let Err(e) = res {
                    swarn!(
                        "idle: poller re-arm failed for fd {}: errno {}",
                        data_fd,
                        e
                    );
                    continue;
                }

                if real.contains(Event::READ) {
                    self.trigger_event(&mut inner, Event::READ);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::WRITE) {
                    self.trigger_event(&mut inner, Event::WRITE);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let this worker dispatch whatever we just queued.
            fiber::yield_now();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn tickle(&self) {
        self.wake_idle();
    }

    fn idle(&self) {
        self.run_idle();
    }

    fn stopping(&self) -> bool {
        self.reactor_stopping()
    }

    fn on_thread_start(&self) {
        self.install_tls();
        if self.config.hook_workers {
            hook::set_hook_enable(true);
        }
    }
}

impl FrontNotify for IoManager {
    /// A shorter deadline appeared; cut the current poller wait short
    fn on_timer_inserted_at_front(&self) {
        self.wake_idle();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn pipe_nonblock() -> (i32, i32) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    #[test]
    fn test_add_del_event_round_trip() {
        let iom = IoManager::new(1, false, "io-roundtrip").unwrap();
        let (r, w) = pipe_nonblock();

        assert_eq!(iom.pending_events(), 0);
        iom.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert_eq!(iom.pending_events(), 1);

        // Duplicate registration is refused
        assert_eq!(
            iom.add_event(r, Event::READ, Some(Box::new(|| {}))),
            Err(EventError::Duplicate)
        );

        // del restores the prior state without dispatching
        assert!(iom.del_event(r, Event::READ));
        assert_eq!(iom.pending_events(), 0);
        assert!(!iom.del_event(r, Event::READ));

        // And the pair can be re-armed afterwards
        iom.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert!(iom.del_event(r, Event::READ));

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_callback_event_fires_on_readiness() {
        let iom = IoManager::new(2, false, "io-cb").unwrap();
        let (r, w) = pipe_nonblock();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            Event::READ,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_cancel_event_dispatches_waiter() {
        let iom = IoManager::new(2, false, "io-cancel").unwrap();
        let (r, w) = pipe_nonblock();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            Event::READ,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        // No readiness at all; cancellation alone must wake the waiter
        assert!(iom.cancel_event(r, Event::READ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);
        // Cancelling again is a no-op
        assert!(!iom.cancel_event(r, Event::READ));

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_read_write_slots_independent() {
        let iom = IoManager::new(2, false, "io-rw").unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));

        let rd = reads.clone();
        iom.add_event(
            a,
            Event::READ,
            Some(Box::new(move || {
                rd.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        let wr = writes.clone();
        iom.add_event(
            a,
            Event::WRITE,
            Some(Box::new(move || {
                wr.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(iom.pending_events(), 2);

        // A socket with buffer space is immediately writable: WRITE fires
        // while READ stays armed until a byte shows up.
        let deadline = Instant::now() + Duration::from_secs(5);
        while writes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(iom.pending_events(), 1);

        assert_eq!(
            unsafe { libc::send(b, b"x".as_ptr() as *const libc::c_void, 1, 0) },
            1
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while reads.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_recurring_timer_cadence() {
        let iom = IoManager::new(2, false, "io-timer").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let timer = iom.add_timer(
            30,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        std::thread::sleep(Duration::from_millis(305));
        let fired = count.load(Ordering::SeqCst);
        assert!(
            (7..=12).contains(&fired),
            "30ms recurring timer fired {} times in 305ms",
            fired
        );

        assert!(timer.cancel());
        let after_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(120));
        let final_count = count.load(Ordering::SeqCst);
        assert!(
            final_count <= after_cancel + 1,
            "timer kept firing after cancel: {} -> {}",
            after_cancel,
            final_count
        );

        iom.stop();
    }

    #[test]
    fn test_current_is_set_on_workers() {
        let iom = IoManager::new(1, false, "io-current").unwrap();
        let ok = Arc::new(AtomicUsize::new(0));
        let o = ok.clone();
        iom.schedule_call(move || {
            if IoManager::current().is_some() {
                o.fetch_add(1, Ordering::SeqCst);
            }
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while ok.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        iom.stop();
    }
}
