//! Resizable worker pool with delayed tasks.
//!
//! Workers are spawned on demand when every existing worker is busy, up to
//! `max_threads`, and exit on their own once more than `max_idle` of them
//! have nothing to do. Tasks are ordered by due time only; tasks due at the
//! same instant run in no particular order.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use vrift_config::PoolConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Run,
    /// Drain the queue, then stop.
    Finish,
    /// Drop the queue, let running tasks finish, then stop.
    Abort,
}

struct Scheduled {
    at: Instant,
    job: Job,
}

// BinaryHeap is a max-heap: invert so the earliest deadline is on top.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for Scheduled {}

struct State {
    lifecycle: Lifecycle,
    queue: BinaryHeap<Scheduled>,
    threads: usize,
    active: usize,
    max_threads: usize,
    max_idle: usize,
}

impl State {
    fn next_due(&self, now: Instant) -> bool {
        self.queue.peek().is_some_and(|task| task.at <= now)
    }

    fn starved(&self) -> bool {
        !self.queue.is_empty() && self.active == self.threads && self.threads < self.max_threads
    }
}

/// Outlives the `ThreadPool` handle: every worker holds a clone.
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    name: String,
    spawned: AtomicUsize,
}

thread_local! {
    // Pool the current thread works for, to spot `stop` from inside a task.
    static WORKER_OF: Cell<*const Shared> = const { Cell::new(std::ptr::null()) };
}

pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(max_threads: usize, max_idle: usize) -> Self {
        Self::with_name(max_threads, max_idle, "vrift-worker")
    }

    pub fn with_name(max_threads: usize, max_idle: usize, name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Run,
                    queue: BinaryHeap::new(),
                    threads: 0,
                    active: 0,
                    max_threads,
                    max_idle,
                }),
                cond: Condvar::new(),
                name: name.into(),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::with_name(config.max_threads, config.max_idle, config.name.clone())
    }

    /// Queue `task` to run once `delay` has elapsed.
    ///
    /// Returns `false` if the pool is stopping or stopped. `true` means the
    /// task was accepted, not that it ran.
    pub fn run<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.lifecycle != Lifecycle::Run {
            return false;
        }

        state.queue.push(Scheduled {
            at: Instant::now() + delay,
            job: Box::new(task),
        });
        if state.active == state.threads && state.threads < state.max_threads {
            spawn_worker(&self.shared, &mut state);
        }
        self.shared.cond.notify_one();
        true
    }

    /// Shorthand for `run(task, Duration::ZERO)`.
    pub fn run_now<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.run(task, Duration::ZERO)
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    pub fn set_max_threads(&self, max_threads: usize) {
        self.update_limits(|state| state.max_threads = max_threads);
    }

    /// Adjust the thread cap by `delta`, saturating at `0` and `usize::MAX`.
    pub fn max_threads_delta(&self, delta: isize) {
        self.update_limits(|state| {
            state.max_threads = state.max_threads.saturating_add_signed(delta)
        });
    }

    pub fn max_idle(&self) -> usize {
        self.shared.state.lock().max_idle
    }

    pub fn set_max_idle(&self, max_idle: usize) {
        self.update_limits(|state| state.max_idle = max_idle);
    }

    /// Adjust the idle cap by `delta`, saturating at `0` and `usize::MAX`.
    pub fn max_idle_delta(&self, delta: isize) {
        self.update_limits(|state| state.max_idle = state.max_idle.saturating_add_signed(delta));
    }

    /// Tasks currently executing.
    pub fn tasks_active(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Tasks queued, due or not.
    pub fn tasks_pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    /// `(active, pending, threads)` from a single snapshot.
    pub fn stats(&self) -> (usize, usize, usize) {
        let state = self.shared.state.lock();
        (state.active, state.queue.len(), state.threads)
    }

    /// Stop accepting tasks and block until every worker has exited.
    ///
    /// Queued tasks still run unless `skip_pending` is set, in which case
    /// they are dropped and only tasks already executing complete. Safe to
    /// call from several threads at once and from inside a task of this
    /// pool (the calling worker then exits after its task returns).
    pub fn stop(&self, skip_pending: bool) {
        let mut state = self.shared.state.lock();
        state.lifecycle = match (state.lifecycle, skip_pending) {
            (Lifecycle::Run, false) => Lifecycle::Finish,
            (_, true) => Lifecycle::Abort,
            (current, false) => current,
        };
        debug!(pool = %self.shared.name, skip_pending, "Stopping thread pool");

        let discarded = if state.lifecycle == Lifecycle::Abort {
            std::mem::take(&mut state.queue)
        } else {
            BinaryHeap::new()
        };
        if state.lifecycle == Lifecycle::Finish && state.threads == 0 && !state.queue.is_empty() {
            spawn_worker(&self.shared, &mut state);
        }
        self.shared.cond.notify_all();

        let me = Arc::as_ptr(&self.shared);
        let own = usize::from(WORKER_OF.with(|pool| pool.get() == me));
        while state.threads > own {
            self.shared.cond.wait(&mut state);
        }
        drop(state);

        if !discarded.is_empty() {
            info!(pool = %self.shared.name, dropped = discarded.len(), "Discarded pending tasks");
        }
    }

    fn update_limits(&self, apply: impl FnOnce(&mut State)) {
        let mut state = self.shared.state.lock();
        apply(&mut state);
        if state.lifecycle != Lifecycle::Abort && state.starved() {
            spawn_worker(&self.shared, &mut state);
        }
        // Lowered caps: let surplus workers notice and exit.
        self.shared.cond.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut State) {
    state.threads += 1;
    let worker = Arc::clone(shared);
    let id = shared.spawned.fetch_add(1, atomic::Ordering::Relaxed);
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", shared.name, id))
        .spawn(move || worker_loop(worker));

    if let Err(e) = spawned {
        state.threads -= 1;
        warn!(
            pool = %shared.name,
            error = %e,
            "Failed to spawn worker, continuing with fewer threads"
        );
    }
}

fn worker_loop(shared: Arc<Shared>) {
    WORKER_OF.with(|pool| pool.set(Arc::as_ptr(&shared)));
    let mut state = shared.state.lock();

    while state.lifecycle != Lifecycle::Abort && state.threads <= state.max_threads {
        if state.next_due(Instant::now()) {
            if let Some(task) = state.queue.pop() {
                state.active += 1;
                if state.starved() {
                    spawn_worker(&shared, &mut state);
                }
                MutexGuard::unlocked(&mut state, || execute(&shared.name, task.job));
                state.active -= 1;
                continue;
            }
        }

        let idle = state.threads - state.active;
        // The last worker stays for delayed tasks even with `max_idle == 0`.
        if idle <= state.max_idle || (!state.queue.is_empty() && state.threads == 1) {
            match (state.queue.peek().map(|task| task.at), state.lifecycle) {
                (Some(at), _) => {
                    shared.cond.wait_until(&mut state, at);
                    continue;
                }
                (None, Lifecycle::Run) => {
                    shared.cond.wait(&mut state);
                    continue;
                }
                _ => {}
            }
        }
        break;
    }

    state.threads -= 1;
    if state.threads == 0 || state.lifecycle != Lifecycle::Run {
        shared.cond.notify_all();
    }
    drop(state);
    WORKER_OF.with(|pool| pool.set(std::ptr::null()));
}

fn execute(pool: &str, job: Job) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        error!(pool, panic = message, "Task panicked");
    }
}
