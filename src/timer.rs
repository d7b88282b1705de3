//! A keyed task scheduler over a monotonic clock.
//!
//! Tasks are addressed by caller-chosen ids, ordered in a
//! [`KeyedHeap`](crate::keyed_heap::KeyedHeap) by next run instant, and
//! executed on one dedicated background thread. The lock is released while
//! a callback runs, so `add` / `update` / `cancel` from other threads never
//! wait on user code; operations aimed at the executing task are deferred
//! until its callback returns.
//!
//! The server arms one task per connection as the idle-expiry clock and
//! pushes its deadline forward on every successful read or write.

use std::cmp::Ordering as CmpOrdering;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::keyed_heap::KeyedHeap;

/// Runs forever until cancelled.
pub const TIMES_INFINITE: i32 = -1;

type Callback = Box<dyn FnMut() + Send>;
type Mutator = Box<dyn FnOnce(&mut TimerTask) + Send>;
type TaskCmp = fn(&TimerTask, &TimerTask) -> CmpOrdering;

/// One scheduled task.
///
/// A task sits in the heap iff `times != 0`: `-1` means run forever, a
/// positive count is decremented after each run, and `0` marks a
/// cancelled or exhausted task.
pub struct TimerTask {
    callback: Callback,
    start_delay: Duration,
    times: i32,
    interval: Duration,
    next_run: Instant,
}

impl TimerTask {
    fn new(callback: Callback, start_delay: Duration, times: i32, interval: Duration) -> Self {
        Self {
            callback,
            start_delay,
            times,
            interval,
            next_run: Instant::now() + start_delay,
        }
    }

    /// Remaining runs: `-1` is infinite, `0` is cancelled.
    pub fn times(&self) -> i32 {
        self.times
    }

    /// Overrides the remaining run count.
    pub fn set_times(&mut self, times: i32) {
        self.times = times;
    }

    /// The pause between runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// The task's next deadline.
    pub fn next_run(&self) -> Instant {
        self.next_run
    }

    /// Re-anchors the deadline at `now + start_delay`.
    pub fn reset_next_run(&mut self, now: Instant) {
        self.next_run = now + self.start_delay;
    }

    /// Marks the task as cancelled.
    pub fn cancel(&mut self) {
        self.times = 0;
    }

    fn needs_schedule(&self) -> bool {
        self.times != 0
    }

    fn reduce_times(&mut self) {
        if self.times > 0 {
            self.times -= 1;
        }
    }
}

fn by_deadline(a: &TimerTask, b: &TimerTask) -> CmpOrdering {
    a.next_run.cmp(&b.next_run)
}

struct TimerState<K>
where
    K: Eq + Hash + Clone,
{
    heap: KeyedHeap<K, TimerTask, TaskCmp>,
    /// Id of the task whose callback is running right now. While set, the
    /// task is absent from the heap.
    current: Option<K>,
    /// Cancel the executing task once its callback returns.
    remove_current: bool,
    /// Mutate the executing task once its callback returns.
    update_current: Option<Mutator>,
}

struct Inner<K>
where
    K: Eq + Hash + Clone,
{
    state: Mutex<TimerState<K>>,
    cv: Condvar,
    running: AtomicBool,
    steady: AtomicBool,
}

/// A keyed timer with its own scheduler thread.
///
/// # Examples
///
/// ```
/// use erebus::timer::Timer;
/// use std::time::Duration;
///
/// let timer: Timer<u32> = Timer::new();
/// timer.add(1, Box::new(|| {}), Duration::from_millis(10), 1, Duration::ZERO);
/// timer.start();
/// ```
pub struct Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    inner: Arc<Inner<K>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<K> Default for Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TimerState {
                    heap: KeyedHeap::new(by_deadline as TaskCmp),
                    current: None,
                    remove_current: false,
                    update_current: None,
                }),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                steady: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Schedules a task. The task will not run before [`start`](Self::start);
    /// tasks added while running honor their `start_delay` from now.
    ///
    /// Returns `false` when `times == 0` or the id is already in use
    /// (including by the task currently executing).
    pub fn add(
        &self,
        id: K,
        callback: Callback,
        start_delay: Duration,
        times: i32,
        interval: Duration,
    ) -> bool {
        if times == 0 {
            return false;
        }
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        if state.heap.contains(&id) || state.current.as_ref() == Some(&id) {
            return false;
        }
        let mut task = TimerTask::new(callback, start_delay, times, interval);
        if self.inner.running.load(Ordering::Acquire) {
            task.reset_next_run(Instant::now());
        }
        state.heap.push(id, task);
        drop(state);
        // Wake the scheduler so it can reconsider its next deadline.
        self.inner.cv.notify_one();
        true
    }

    /// Mutates a scheduled task and restores heap order. When the task is
    /// currently executing, the mutation is deferred until its callback
    /// returns.
    ///
    /// Returns `false` if no such task exists.
    pub fn update(&self, id: &K, f: impl FnOnce(&mut TimerTask) + Send + 'static) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        let found = if state.heap.contains(id) {
            state.heap.update(id, f)
        } else if state.current.as_ref() == Some(id) {
            state.update_current = Some(Box::new(f));
            true
        } else {
            false
        };
        drop(state);
        if found && self.inner.running.load(Ordering::Acquire) {
            self.inner.cv.notify_one();
        }
        found
    }

    /// Removes a task. When it is currently executing, it is marked for
    /// removal once its callback returns (the in-flight run completes).
    ///
    /// Returns `false` if no such task exists.
    pub fn cancel(&self, id: &K) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        if state.heap.remove(id).is_some() {
            return true;
        }
        if state.current.as_ref() == Some(id) {
            state.remove_current = true;
            return true;
        }
        false
    }

    /// Whether a task with this id is known (scheduled or executing).
    pub fn contains(&self, id: &K) -> bool {
        let Ok(state) = self.inner.state.lock() else {
            return false;
        };
        state.heap.contains(id) || (state.current.as_ref() == Some(id) && !state.remove_current)
    }

    /// Starts the scheduler thread, re-anchoring every task's deadline at
    /// `now + start_delay`.
    ///
    /// Returns `false` if already running.
    pub fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let Ok(mut state) = self.inner.state.lock() else {
                self.inner.running.store(false, Ordering::Release);
                return false;
            };
            let now = Instant::now();
            state.heap.update_all(|task| task.reset_next_run(now));
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("erebus-timer".to_owned())
            .spawn(move || inner.scheduler())
            .expect("failed to spawn timer thread");
        *self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Stops the scheduler thread. Scheduled tasks stay in the heap and a
    /// later [`start`](Self::start) resumes them with fresh deadlines.
    ///
    /// Returns `false` if not running.
    pub fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.inner.cv.notify_all();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if let Ok(mut state) = self.inner.state.lock() {
            state.current = None;
            state.remove_current = false;
            state.update_current = None;
        }
        true
    }

    /// In steady mode the next run is `previous deadline + interval`
    /// (cron-like catch-up); otherwise `now + interval`.
    pub fn set_steady(&self, steady: bool) {
        self.inner.steady.store(steady, Ordering::Release);
    }

    /// Removes every task. The executing task, if any, finishes its
    /// current run and is then dropped.
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.heap.clear();
            if state.current.is_some() {
                state.remove_current = true;
            }
        }
    }

    /// Number of scheduled tasks (the executing one not included).
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.heap.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn scheduler(self: Arc<Self>) {
        let Ok(mut state) = self.state.lock() else {
            log::error!("timer state poisoned; scheduler exiting");
            return;
        };
        while self.running.load(Ordering::Acquire) {
            if state.heap.is_empty() {
                state = match self.cv.wait(state) {
                    Ok(state) => state,
                    Err(_) => {
                        log::error!("timer state poisoned; scheduler exiting");
                        return;
                    }
                };
                continue;
            }
            // A cancelled task may still sit in the heap after update().
            if !state.heap.peek().expect("non-empty").1.needs_schedule() {
                state.heap.pop();
                continue;
            }

            let now = Instant::now();
            let deadline = state.heap.peek().expect("non-empty").1.next_run;
            if deadline <= now {
                state = match self.run_one(state, now) {
                    Ok(state) => state,
                    Err(_) => {
                        log::error!("timer state poisoned; scheduler exiting");
                        return;
                    }
                };
            } else {
                state = match self.cv.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(_) => {
                        log::error!("timer state poisoned; scheduler exiting");
                        return;
                    }
                };
            }
        }
    }

    /// Pops and runs the front task with the lock released, then applies
    /// any deferred cancel/update and re-queues the task if still valid.
    fn run_one<'a>(
        &'a self,
        mut state: MutexGuard<'a, TimerState<K>>,
        now: Instant,
    ) -> Result<MutexGuard<'a, TimerState<K>>, PoisonError<MutexGuard<'a, TimerState<K>>>> {
        let (id, mut task) = state.heap.pop().expect("non-empty");
        state.current = Some(id.clone());
        drop(state);

        // Callback panics are swallowed; the scheduler must outlive them.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| (task.callback)()));

        let mut state = self.state.lock()?;
        task.reduce_times();
        if self.steady.load(Ordering::Acquire) {
            // Catch-up scheduling, anchored at the previous deadline.
            task.next_run += task.interval;
        } else {
            task.next_run = now + task.interval;
        }

        if !state.remove_current {
            if let Some(mutate) = state.update_current.take() {
                mutate(&mut task);
            }
            if task.needs_schedule() {
                state.heap.push(id, task);
            }
        }
        state.current = None;
        state.remove_current = false;
        state.update_current = None;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Tests that a task with finite `times = k` runs exactly k times and
    /// its id becomes reusable afterwards.
    #[test]
    fn test_finite_times() {
        let timer: Timer<u32> = Timer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(timer.add(
            1,
            counting(&counter),
            Duration::from_millis(5),
            3,
            Duration::from_millis(5),
        ));
        timer.start();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!timer.contains(&1));
        // The id is free again once the task ran out.
        assert!(timer.add(1, counting(&counter), Duration::from_millis(1), 1, Duration::ZERO));
        timer.stop();
    }

    /// Tests parameter validation and duplicate-id rejection.
    #[test]
    fn test_add_rejections() {
        let timer: Timer<u32> = Timer::new();
        assert!(!timer.add(1, Box::new(|| {}), Duration::ZERO, 0, Duration::ZERO));
        assert!(timer.add(1, Box::new(|| {}), Duration::from_secs(10), 1, Duration::ZERO));
        assert!(!timer.add(1, Box::new(|| {}), Duration::from_secs(10), 1, Duration::ZERO));
    }

    /// Tests that cancel removes a pending task before it fires.
    #[test]
    fn test_cancel_pending() {
        let timer: Timer<u32> = Timer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timer.add(7, counting(&counter), Duration::from_millis(30), 1, Duration::ZERO);
        timer.start();
        assert!(timer.cancel(&7));
        assert!(!timer.cancel(&7));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        timer.stop();
    }

    /// Tests that update pushes a pending deadline forward, the idle-refresh
    /// pattern the server relies on.
    #[test]
    fn test_update_postpones() {
        let timer: Timer<u32> = Timer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timer.add(1, counting(&counter), Duration::from_millis(40), 1, Duration::ZERO);
        timer.start();
        thread::sleep(Duration::from_millis(25));
        let postponed = Instant::now() + Duration::from_millis(60);
        assert!(timer.update(&1, move |task| {
            task.next_run = postponed;
        }));
        thread::sleep(Duration::from_millis(30));
        // Original deadline passed; the task must not have fired yet.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        timer.stop();
    }

    /// Tests that an infinite task keeps firing until cancelled.
    #[test]
    fn test_infinite_until_cancel() {
        let timer: Timer<&'static str> = Timer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timer.add(
            "tick",
            counting(&counter),
            Duration::from_millis(5),
            TIMES_INFINITE,
            Duration::from_millis(5),
        );
        timer.start();
        thread::sleep(Duration::from_millis(60));
        assert!(timer.cancel(&"tick"));
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several runs, saw {seen}");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        timer.stop();
    }

    /// Tests that a panicking callback does not kill the scheduler.
    #[test]
    fn test_callback_panic_swallowed() {
        let timer: Timer<u32> = Timer::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timer.add(
            1,
            Box::new(|| panic!("scheduled panic")),
            Duration::from_millis(5),
            1,
            Duration::ZERO,
        );
        timer.add(2, counting(&counter), Duration::from_millis(20), 1, Duration::ZERO);
        timer.start();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        timer.stop();
    }

    /// Tests stop/start idempotence and deadline re-anchoring on restart.
    #[test]
    fn test_stop_start_cycle() {
        let timer: Timer<u32> = Timer::new();
        assert!(!timer.stop());
        let counter = Arc::new(AtomicUsize::new(0));
        timer.add(1, counting(&counter), Duration::from_millis(10), 1, Duration::ZERO);
        assert!(timer.start());
        assert!(!timer.start());
        assert!(timer.stop());

        // Nothing fired if we stopped fast enough; either way a restart
        // re-anchors and completes the task.
        timer.start();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        timer.stop();
    }
}
