//! Pool-based fiber scheduler
//!
//! A `Scheduler` owns a shared FIFO of tasks and a pool of worker threads,
//! each running the dispatch loop `run`. Tasks are fibers or plain
//! callbacks (wrapped in a one-shot fiber at dispatch time) and may be
//! pinned to a specific worker tid; the queue is scanned linearly so pins
//! are honored without reordering the rest.
//!
//! There is no work stealing: whichever worker wins the queue lock takes
//! the next eligible task.
//!
//! The reactor specializes three points through [`SchedulerHooks`]:
//! `tickle` (wake an idle worker), `idle` (the body of each worker's idle
//! fiber) and `stopping` (extra shutdown conditions). The base scheduler
//! leaves `tickle` a no-op and naps in `idle`.

use crate::fiber::{self, Fiber, FiberState};
use crate::thread::{self, Thread};

use strand_core::error::{SchedError, SchedResult};
use strand_core::sdebug;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Nap length of the base idle fiber between stop checks
const IDLE_NAP_MS: u64 = 50;

/// What a queued task runs
pub enum TaskKind {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a callback inside a fresh one-shot fiber
    Call(Box<dyn FnOnce() + Send>),
}

/// One entry in the scheduler queue
pub struct ScheduleTask {
    pub kind: TaskKind,
    /// Target worker tid; -1 means any thread
    pub thread: i32,
}

impl ScheduleTask {
    pub fn fiber(f: Arc<Fiber>, thread: i32) -> ScheduleTask {
        ScheduleTask {
            kind: TaskKind::Fiber(f),
            thread,
        }
    }

    pub fn call(cb: Box<dyn FnOnce() + Send>, thread: i32) -> ScheduleTask {
        ScheduleTask {
            kind: TaskKind::Call(cb),
            thread,
        }
    }
}

/// Reactor-overridable points of the dispatch machinery
pub trait SchedulerHooks: Send + Sync {
    /// Wake a worker that may be parked in its idle fiber
    fn tickle(&self);

    /// Body of each worker's idle fiber; must return once stopping
    fn idle(&self);

    /// Full stop condition, including reactor state
    fn stopping(&self) -> bool;

    /// Runs on every worker thread before its dispatch loop starts
    fn on_thread_start(&self) {}
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
}

/// Fiber/task dispatcher over a worker thread pool
pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<Thread>>,
    /// Workers spawned by `start()` (excludes an adopted caller)
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    use_caller: bool,
    /// Tid of the adopting thread, -1 without `use_caller`
    root_tid: i32,
    /// Dispatch fiber living on the adopting thread
    scheduler_fiber: Mutex<Option<Arc<Fiber>>>,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
    /// Stack size for internally-created fibers (idle, callback wrappers)
    stack_size: AtomicUsize,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler
    ///
    /// With `use_caller` the constructing thread is adopted as a worker:
    /// its main fiber is installed, a dedicated scheduler fiber bound to
    /// `run` is created (it executes during `stop()`), and one thread is
    /// deducted from the pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let (thread_count, root_tid) = if use_caller {
            (threads - 1, thread::current_tid())
        } else {
            (threads, -1)
        };

        let sched = Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            use_caller,
            root_tid,
            scheduler_fiber: Mutex::new(None),
            hooks: RwLock::new(None),
            stack_size: AtomicUsize::new(crate::fiber::DEFAULT_STACK_SIZE),
            self_ref: weak.clone(),
        });

        if use_caller {
            Fiber::current();
            let weak = sched.self_ref.clone();
            let sf = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            );
            Fiber::set_scheduler_fiber(&sf);
            *sched.scheduler_fiber.lock().unwrap() = Some(sf);
            sched.install_tls();
        }

        sdebug!("{}: scheduler created ({} pool threads)", name, thread_count);
        sched
    }

    /// Scheduler registered for the calling thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    fn install_tls(&self) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.self_ref.clone()));
    }

    /// Install the reactor's hook implementations
    pub fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    /// Stack size used for internally-created fibers
    pub fn set_stack_size(&self, size: usize) {
        self.stack_size.store(size, Ordering::Relaxed);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Queue a task; wakes a worker if the queue was empty
    pub fn schedule(&self, task: ScheduleTask) {
        let need_tickle = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a fiber for resumption
    pub fn schedule_fiber(&self, f: Arc<Fiber>, thread: i32) {
        self.schedule(ScheduleTask::fiber(f, thread));
    }

    /// Queue a callback; it runs inside a fresh one-shot fiber
    pub fn schedule_call<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(ScheduleTask::call(Box::new(cb), -1));
    }

    fn tickle(&self) {
        if let Some(h) = self.hooks() {
            h.tickle();
        }
    }

    /// Spawn the pool threads, each running the dispatch loop
    pub fn start(&self) -> SchedResult<()> {
        if self.stop_requested() {
            return Err(SchedError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }

        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.thread_count {
            let weak = self.self_ref.clone();
            let t = Thread::new(&format!("{}_{}", self.name, i), move || {
                if let Some(s) = weak.upgrade() {
                    s.run();
                }
            })?;
            threads.push(t);
        }
        Ok(())
    }

    /// Dispatch loop; runs on every pool thread and, during `stop()`, on
    /// the adopting thread's scheduler fiber
    fn run(self: Arc<Self>) {
        let tid = thread::current_tid();
        sdebug!("{}: run() starts in thread {}", self.name, tid);

        self.install_tls();
        if let Some(h) = self.hooks() {
            h.on_thread_start();
        }

        if tid != self.root_tid {
            // Pool thread: install its main fiber (doubles as the
            // scheduler fiber for run_in_scheduler yields here).
            Fiber::current();
        }

        let stack_size = self.stack_size.load(Ordering::Relaxed);
        let me = self.clone();
        let idle_fiber = Fiber::new(move || me.idle_entry(), stack_size, true);

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut q = self.tasks.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    let pin = q[i].thread;
                    if pin != -1 && pin != tid {
                        // Pinned elsewhere; let the owner know after we
                        // release the lock.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    task = q.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !q.is_empty();
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(ScheduleTask {
                    kind: TaskKind::Fiber(f),
                    ..
                }) => {
                    {
                        let _exec = f.exec_lock().lock().unwrap();
                        if f.state() != FiberState::Term {
                            f.resume();
                        }
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(ScheduleTask {
                    kind: TaskKind::Call(cb),
                    ..
                }) => {
                    let cb_fiber = Fiber::new(cb, stack_size, true);
                    {
                        let _exec = cb_fiber.exec_lock().lock().unwrap();
                        cb_fiber.resume();
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    // Idle fiber going TERM is the exit signal.
                    if idle_fiber.state() == FiberState::Term {
                        sdebug!("{}: run() ends in thread {}", self.name, tid);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Idle fiber body: reactor loop when hooked, nap loop otherwise
    fn idle_entry(&self) {
        if let Some(h) = self.hooks() {
            h.idle();
            return;
        }
        while !self.base_stopping() {
            std::thread::sleep(Duration::from_millis(IDLE_NAP_MS));
            fiber::yield_now();
        }
    }

    /// Stop condition of the bare scheduler: stop requested, queue empty,
    /// nothing mid-dispatch
    pub fn base_stopping(&self) -> bool {
        let q = self.tasks.lock().unwrap();
        self.stop_requested() && q.is_empty() && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Full stop condition (reactor-aware when hooks are installed)
    pub fn stopping(&self) -> bool {
        if let Some(h) = self.hooks() {
            h.stopping()
        } else {
            self.base_stopping()
        }
    }

    /// Stop the scheduler and join the pool
    ///
    /// With `use_caller`, must run on the adopting thread (the scheduler
    /// fiber executes queued work here until drained); without it, must
    /// not run on one of this scheduler's workers.
    pub fn stop(&self) {
        sdebug!("{}: stop() in thread {}", self.name, thread::current_tid());
        if self.stopping() {
            return;
        }
        self.stop_requested.store(true, Ordering::Release);

        let current = Scheduler::current();
        let is_this = current
            .as_ref()
            .map(|c| std::ptr::eq(Arc::as_ptr(c), self as *const Scheduler))
            .unwrap_or(false);
        if self.use_caller {
            assert!(is_this, "stop() must run on the adopting thread");
        } else {
            assert!(!is_this, "stop() must not run on a worker of this scheduler");
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let scheduler_fiber = self.scheduler_fiber.lock().unwrap().clone();
        if scheduler_fiber.is_some() {
            self.tickle();
        }

        // Workers are going away; pins to them would strand the tasks.
        {
            let mut q = self.tasks.lock().unwrap();
            for t in q.iter_mut() {
                t.thread = -1;
            }
        }

        if let Some(sf) = scheduler_fiber {
            // Runs the dispatch loop on this thread until it observes the
            // stop flag and its idle fiber terminates.
            sf.resume();
            sdebug!("{}: scheduler fiber finished", self.name);
        }

        let threads = { std::mem::take(&mut *self.threads.lock().unwrap()) };
        for t in threads {
            t.join();
        }
        sdebug!("{}: stop() done", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_schedule_runs_tasks_fifo() {
        let sched = Scheduler::new(1, false, "sched-fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let o = order.clone();
            sched.schedule_call(move || o.lock().unwrap().push(i));
        }
        sched.start().unwrap();

        // One worker, FIFO queue: strict order
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while order.lock().unwrap().len() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.stop();
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_scheduled_fiber_not_dropped_by_stop() {
        let sched = Scheduler::new(2, false, "sched-stop");
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        );
        sched.schedule_fiber(fiber.clone(), -1);

        std::thread::sleep(Duration::from_millis(200));
        sched.stop();

        // Either it ran to TERM or it is still READY and owned by us
        match fiber.state() {
            FiberState::Term => assert_eq!(hits.load(Ordering::SeqCst), 1),
            FiberState::Ready => assert_eq!(hits.load(Ordering::SeqCst), 0),
            s => panic!("fiber in unexpected state {:?}", s),
        }
    }

    #[test]
    fn test_pinned_task_runs_on_target_thread() {
        let sched = Scheduler::new(2, false, "sched-pin");
        sched.start().unwrap();

        let target = sched.threads.lock().unwrap()[1].tid();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let s = seen.clone();
            sched.schedule(ScheduleTask::call(
                Box::new(move || s.lock().unwrap().push(thread::current_tid())),
                target,
            ));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        for tid in seen.iter() {
            assert_eq!(*tid, target);
        }
    }

    #[test]
    fn test_use_caller_runs_work_in_stop() {
        let sched = Scheduler::new(1, true, "sched-caller");
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            sched.schedule_call(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Zero pool threads: everything runs on the adopting thread,
        // inside stop().
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
