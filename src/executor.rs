//! A fixed-size worker pool over a single FIFO task queue.
//!
//! The reactor thread submits per-connection read and write handlers here;
//! workers block on a condition variable until work arrives. The pool can
//! be paused (submissions keep queueing), drained, and resized.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::JobError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Task>,
    /// Workers exit once this drops; queued tasks are then discarded.
    running: bool,
    /// A paused pool accepts submissions but dispatches nothing.
    paused: bool,
    /// Queued plus currently running tasks.
    total: usize,
}

struct Shared {
    state: Mutex<State>,
    task_available: Condvar,
    task_done: Condvar,
}

/// A thread pool executing submitted closures in FIFO submission order.
///
/// Ordering is FIFO in the queue sense only: with more than one worker,
/// tasks popped in order may still finish out of order.
///
/// Dropping the pool waits for every queued and running task to complete
/// (unless the pool is paused, in which case only running tasks are waited
/// for and the queue is discarded). Cancellation is the tasks' own
/// business; the pool never kills a running closure.
///
/// # Examples
///
/// ```
/// use erebus::executor::WorkerPool;
///
/// let pool = WorkerPool::new(2);
/// let handle = pool.submit_with_handle(|| 6 * 7);
/// assert_eq!(handle.wait().unwrap(), 42);
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Creates a pool with `count` workers; `0` means the hardware thread
    /// count (floor 1).
    pub fn new(count: usize) -> Self {
        let thread_count = Self::determine_thread_count(count);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: true,
                paused: false,
                total: 0,
            }),
            task_available: Condvar::new(),
            task_done: Condvar::new(),
        });
        let threads = Self::spawn_workers(&shared, thread_count);
        Self {
            shared,
            threads,
            thread_count,
        }
    }

    fn determine_thread_count(count: usize) -> usize {
        if count > 0 {
            count
        } else {
            num_cpus::get().max(1)
        }
    }

    fn spawn_workers(shared: &Arc<Shared>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("erebus-worker-{i}"))
                    .spawn(move || {
                        if let Err(e) = shared.run_worker() {
                            log::error!("worker thread error: {e}");
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect()
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.shared.lock_state().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Tasks currently executing on a worker.
    pub fn running_tasks(&self) -> usize {
        self.shared
            .lock_state()
            .map(|s| s.total - s.queue.len())
            .unwrap_or(0)
    }

    /// Queued plus running tasks.
    pub fn total_tasks(&self) -> usize {
        self.shared.lock_state().map(|s| s.total).unwrap_or(0)
    }

    /// Whether the pool is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.lock_state().map(|s| s.paused).unwrap_or(false)
    }

    /// Queues a task. The caller owns any synchronization the task's
    /// captures need.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let result: Result<(), JobError> = (|| {
            let mut state = self.shared.lock_state()?;
            state.queue.push_back(Box::new(task));
            state.total += 1;
            Ok(())
        })();

        match result {
            Ok(()) => self.shared.task_available.notify_one(),
            Err(e) => log::error!("failed to queue task: {e}"),
        }
    }

    /// Queues a task and returns a one-shot handle to its result.
    ///
    /// A panic inside the task is caught at the worker boundary and
    /// surfaces as [`JobError::Panicked`]; a task discarded before it ran
    /// (pool dropped while paused) surfaces as [`JobError::Disconnected`].
    pub fn submit_with_handle<T, F>(&self, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let state = Arc::new(HandleState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        let guard = SettleGuard {
            state: state.clone(),
            settled: std::cell::Cell::new(false),
        };
        self.submit(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            guard.settle(match outcome {
                Ok(value) => Ok(value),
                Err(payload) => Err(JobError::Panicked(panic_message(&payload))),
            });
        });
        JobHandle { state }
    }

    /// Stops dispatching queued tasks. Running tasks keep running;
    /// submissions keep queueing.
    pub fn pause(&self) {
        match self.shared.lock_state() {
            Ok(mut state) => state.paused = true,
            Err(e) => log::error!("cannot pause pool: {e}"),
        }
    }

    /// Resumes dispatching queued tasks.
    pub fn unpause(&self) {
        match self.shared.lock_state() {
            Ok(mut state) => state.paused = false,
            Err(e) => log::error!("cannot unpause pool: {e}"),
        }
        self.shared.task_available.notify_all();
    }

    /// Blocks until the pool is idle: no running tasks, and no queued
    /// tasks either unless the pool is paused.
    pub fn wait_idle(&self) {
        let Ok(mut state) = self.shared.lock_state() else {
            log::error!("cannot wait for idle pool: lock poisoned");
            return;
        };
        loop {
            let target = if state.paused { state.queue.len() } else { 0 };
            if state.total == target {
                return;
            }
            state = match self.shared.task_done.wait(state) {
                Ok(state) => state,
                Err(_) => {
                    log::error!("cannot wait for idle pool: lock poisoned");
                    return;
                }
            };
        }
    }

    /// Replaces the worker threads with `count` fresh ones (`0` means the
    /// hardware thread count). Running tasks are waited for; queued tasks
    /// survive and are picked up by the new workers. A paused pool stays
    /// paused.
    pub fn reset(&mut self, count: usize) {
        let was_paused = self.is_paused();
        self.pause();
        self.wait_idle();
        self.join_workers();

        self.thread_count = Self::determine_thread_count(count);
        match self.shared.lock_state() {
            Ok(mut state) => {
                state.running = true;
                state.paused = was_paused;
            }
            Err(e) => log::error!("cannot reset pool state: {e}"),
        }
        self.threads = Self::spawn_workers(&self.shared, self.thread_count);
        if !was_paused {
            self.shared.task_available.notify_all();
        }
    }

    fn join_workers(&mut self) {
        match self.shared.lock_state() {
            Ok(mut state) => state.running = false,
            Err(e) => log::error!("cannot signal workers to exit: {e}"),
        }
        self.shared.task_available.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.wait_idle();
        self.join_workers();
    }
}

impl Shared {
    fn lock_state(&self) -> Result<MutexGuard<'_, State>, JobError> {
        self.state.lock().map_err(|_| JobError::LockPoisoned)
    }

    fn run_worker(&self) -> Result<(), JobError> {
        loop {
            let mut state = self.lock_state()?;
            loop {
                if !state.running {
                    return Ok(());
                }
                if !state.paused && !state.queue.is_empty() {
                    break;
                }
                state = self
                    .task_available
                    .wait(state)
                    .map_err(|_| JobError::LockPoisoned)?;
            }
            let task = state.queue.pop_front().expect("checked non-empty");
            drop(state);

            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("worker task panicked");
            }

            let mut state = self.lock_state()?;
            state.total -= 1;
            drop(state);
            self.task_done.notify_all();
        }
    }
}

struct HandleState<T> {
    result: Mutex<Option<Result<T, JobError>>>,
    done: Condvar,
}

/// Settles the handle exactly once, even when the task is dropped unrun.
struct SettleGuard<T> {
    state: Arc<HandleState<T>>,
    settled: std::cell::Cell<bool>,
}

impl<T> SettleGuard<T> {
    fn settle(&self, outcome: Result<T, JobError>) {
        self.settled.set(true);
        if let Ok(mut slot) = self.state.result.lock() {
            *slot = Some(outcome);
            self.state.done.notify_all();
        }
    }
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        if self.settled.get() {
            return;
        }
        if let Ok(mut slot) = self.state.result.lock() {
            *slot = Some(Err(JobError::Disconnected));
            self.state.done.notify_all();
        }
    }
}

/// A one-shot handle to a submitted task's result.
pub struct JobHandle<T> {
    state: Arc<HandleState<T>>,
}

impl<T> JobHandle<T> {
    /// Blocks until the task settles and returns its result.
    pub fn wait(self) -> Result<T, JobError> {
        let mut slot = self
            .state
            .result
            .lock()
            .map_err(|_| JobError::LockPoisoned)?;
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self
                .state
                .done
                .wait(slot)
                .map_err(|_| JobError::LockPoisoned)?;
        }
    }

    /// Returns the result if the task has settled, without blocking.
    pub fn try_wait(&self) -> Option<Result<T, JobError>> {
        match self.state.result.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some(Err(JobError::LockPoisoned)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
