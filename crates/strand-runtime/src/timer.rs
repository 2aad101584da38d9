//! Absolute-deadline timers
//!
//! `TimerManager` keeps timers in a map ordered by `(deadline, id)`, so
//! equal deadlines break ties deterministically. Expiry never runs user
//! code inside the manager: `collect_expired` hands the due callbacks to
//! the caller, which schedules them.
//!
//! Deadlines use the wall clock. If the clock is set back by more than an
//! hour, every timer is treated as expired on the next collection pass,
//! so nothing gets stranded behind a rolled-back deadline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

/// Rollback distance treated as a clock rollover
const ROLLOVER_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Callback type shared by one-shot and recurring timers
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Receiver of "a new earliest timer exists" notifications
///
/// The reactor uses this to cut short a poller wait that was computed
/// against the previous earliest deadline.
pub trait FrontNotify: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

fn deadline_after(now: SystemTime, ms: u64) -> SystemTime {
    now.checked_add(Duration::from_millis(ms))
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

struct TimerData {
    /// Period in milliseconds
    ms: u64,
    /// Absolute next deadline
    next: SystemTime,
    recurring: bool,
    /// None exactly when the timer is cancelled/fired and out of the map
    cb: Option<TimerCallback>,
}

/// Handle to one scheduled timer
pub struct Timer {
    id: u64,
    inner: Mutex<TimerData>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Cancel the timer; false if it already fired or was cancelled
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut map = mgr.inner.write().unwrap();
        let mut data = self.inner.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        data.cb = None;
        map.timers.remove(&(data.next, self.id));
        true
    }

    /// Push the deadline out to now + period; false for dead timers
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut map = mgr.inner.write().unwrap();
        let mut data = self.inner.lock().unwrap();
        if data.cb.is_none() {
            return false;
        }
        let Some(arc) = map.timers.remove(&(data.next, self.id)) else {
            return false;
        };
        data.next = deadline_after(SystemTime::now(), data.ms);
        let key = (data.next, self.id);
        drop(data);
        map.timers.insert(key, arc);
        true
    }

    /// Change the period and re-anchor the deadline
    ///
    /// `from_now` anchors at the current time; otherwise the original
    /// start (`next - old period`) is kept. Re-inserting goes through the
    /// front-notification path so a shortened deadline wakes the poller.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        {
            let data = self.inner.lock().unwrap();
            if ms == data.ms && !from_now {
                return true;
            }
        }
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };

        let arc = {
            let mut map = mgr.inner.write().unwrap();
            let mut data = self.inner.lock().unwrap();
            if data.cb.is_none() {
                return false;
            }
            let Some(arc) = map.timers.remove(&(data.next, self.id)) else {
                return false;
            };
            let start = if from_now {
                SystemTime::now()
            } else {
                data.next - Duration::from_millis(data.ms)
            };
            data.ms = ms;
            data.next = deadline_after(start, ms);
            arc
        };

        mgr.insert(&arc);
        true
    }
}

struct TimerMap {
    /// Ordered by (deadline, id); holds the owning handles
    timers: BTreeMap<(SystemTime, u64), Arc<Timer>>,
    /// Last observed wall time, for rollover detection
    previous_time: SystemTime,
}

/// Ordered set of timers plus the front-insert notification plumbing
pub struct TimerManager {
    inner: RwLock<TimerMap>,
    /// An earliest-timer notification is already in flight
    tickled: AtomicBool,
    notify: RwLock<Option<Weak<dyn FrontNotify>>>,
    next_id: AtomicU64,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            inner: RwLock::new(TimerMap {
                timers: BTreeMap::new(),
                previous_time: SystemTime::now(),
            }),
            tickled: AtomicBool::new(false),
            notify: RwLock::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    /// Install the front-insert notification target
    pub fn set_notify(&self, notify: Weak<dyn FrontNotify>) {
        *self.notify.write().unwrap() = Some(notify);
    }

    fn notify_target(&self) -> Option<Arc<dyn FrontNotify>> {
        self.notify.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Schedule `cb` to run after `ms` milliseconds
    pub fn add_timer<F>(self: &Arc<Self>, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Arc::new(Timer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(TimerData {
                ms,
                next: deadline_after(SystemTime::now(), ms),
                recurring,
                cb: Some(Arc::new(cb)),
            }),
            manager: Arc::downgrade(self),
        });
        self.insert(&timer);
        timer
    }

    /// Schedule `cb`, but only run it if `cond` is still alive at expiry
    ///
    /// The witness is upgraded once, before the callback, and held across
    /// the call; a dead witness silently drops the fire.
    pub fn add_condition_timer<F, T>(
        self: &Arc<Self>,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if let Some(_witness) = cond.upgrade() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Insert an armed timer and fire the front notification if it became
    /// the new earliest (at most one notification until the next
    /// `next_timeout_ms` call)
    fn insert(&self, timer: &Arc<Timer>) {
        let at_front;
        {
            let mut map = self.inner.write().unwrap();
            let key = {
                let data = timer.inner.lock().unwrap();
                (data.next, timer.id)
            };
            map.timers.insert(key, timer.clone());
            let is_first = map
                .timers
                .first_key_value()
                .map(|(k, _)| *k == key)
                .unwrap_or(false);
            at_front = is_first && !self.tickled.swap(true, Ordering::AcqRel);
        }
        if at_front {
            if let Some(n) = self.notify_target() {
                n.on_timer_inserted_at_front();
            }
        }
    }

    /// Milliseconds until the earliest deadline
    ///
    /// 0 if already due, `u64::MAX` if the set is empty. Also re-arms the
    /// front notification.
    pub fn next_timeout_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::Release);
        let map = self.inner.read().unwrap();
        let Some((key, _)) = map.timers.first_key_value() else {
            return u64::MAX;
        };
        match key.0.duration_since(SystemTime::now()) {
            Ok(d) => d.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Pop every due timer's callback into `out`
    ///
    /// Recurring timers are re-anchored at now + period and reinserted;
    /// one-shots leave the map with their callback nulled.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = SystemTime::now();
        let mut map = self.inner.write().unwrap();

        let rollover = match map.previous_time.checked_sub(ROLLOVER_THRESHOLD) {
            Some(threshold) => now < threshold,
            None => false,
        };
        map.previous_time = now;

        loop {
            let due = match map.timers.first_key_value() {
                Some((key, _)) => rollover || key.0 <= now,
                None => break,
            };
            if !due {
                break;
            }
            let (_, timer) = map.timers.pop_first().unwrap();

            let mut data = timer.inner.lock().unwrap();
            if let Some(cb) = data.cb.clone() {
                out.push(cb);
            }
            if data.recurring {
                data.next = deadline_after(now, data.ms);
                let key = (data.next, timer.id);
                drop(data);
                map.timers.insert(key, timer);
            } else {
                data.cb = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collect(mgr: &Arc<TimerManager>) -> Vec<TimerCallback> {
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        out
    }

    #[test]
    fn test_expiry_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (ms, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let o = order.clone();
            mgr.add_timer(ms, move || o.lock().unwrap().push(tag), false);
        }

        std::thread::sleep(Duration::from_millis(50));
        for cb in collect(&mgr) {
            cb();
        }
        assert_eq!(&*order.lock().unwrap(), &[1, 2, 3]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timeout_bounds() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout_ms(), u64::MAX);

        let timer = mgr.add_timer(200, || {}, false);
        let ms = mgr.next_timeout_ms();
        assert!(ms <= 200);
        timer.cancel();
        assert_eq!(mgr.next_timeout_ms(), u64::MAX);
    }

    #[test]
    fn test_due_timer_reports_zero() {
        let mgr = TimerManager::new();
        mgr.add_timer(0, || {}, false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.next_timeout_ms(), 0);
    }

    #[test]
    fn test_cancel_idempotent() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        std::thread::sleep(Duration::from_millis(5));
        for cb in collect(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Fired one-shot is gone for good
        assert!(collect(&mgr).is_empty());
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5, || {}, true);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(collect(&mgr).len(), 1);
        assert!(mgr.has_timer());

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(collect(&mgr).len(), 1);

        timer.cancel();
        std::thread::sleep(Duration::from_millis(10));
        assert!(collect(&mgr).is_empty());
    }

    #[test]
    fn test_condition_timer_witness() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        // Live witness: fires
        let witness = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );

        // Dead witness: dropped
        let gone = Arc::new(());
        let weak = Arc::downgrade(&gone);
        drop(gone);
        let h = hits.clone();
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(100, Ordering::SeqCst);
            },
            weak,
            false,
        );

        std::thread::sleep(Duration::from_millis(5));
        for cb in collect(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_from_now() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5000, || {}, false);
        assert!(timer.reset(50, true));

        let ms = mgr.next_timeout_ms();
        assert!(ms <= 50, "deadline should have moved up, got {}", ms);
    }

    #[test]
    fn test_reset_same_period_keeps_anchor() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5000, || {}, false);
        assert!(timer.reset(5000, false));
        let ms = mgr.next_timeout_ms();
        assert!(ms > 4000);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(100, || {}, false);
        std::thread::sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        let ms = mgr.next_timeout_ms();
        assert!(ms > 70, "refresh should re-anchor at now, got {}", ms);
    }

    struct Flag(AtomicUsize);
    impl FrontNotify for Flag {
        fn on_timer_inserted_at_front(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_front_insert_notifies_once() {
        let mgr = TimerManager::new();
        let flag: Arc<Flag> = Arc::new(Flag(AtomicUsize::new(0)));
        let flag_dyn: Arc<dyn FrontNotify> = flag.clone();
        let weak: Weak<dyn FrontNotify> = Arc::downgrade(&flag_dyn);
        mgr.set_notify(weak);

        mgr.add_timer(100, || {}, false);
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);

        // Later deadline: not at front, no notification
        mgr.add_timer(500, || {}, false);
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);

        // Earlier deadline, but a notification is still pending
        mgr.add_timer(50, || {}, false);
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);

        // next_timeout_ms re-arms the notification
        let _ = mgr.next_timeout_ms();
        mgr.add_timer(10, || {}, false);
        assert_eq!(flag.0.load(Ordering::SeqCst), 2);
    }
}
