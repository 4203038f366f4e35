//! Cleaner passes scheduled on a [`ThreadPool`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info};
use vrift_config::CleanerConfig;
use vrift_pool::ThreadPool;

use crate::directory::Directory;
use crate::directory_cleaner;

/// Runs [`directory_cleaner::clean`] every `interval` until stopped.
///
/// Each pass schedules the next one when it finishes, so passes never
/// overlap. The pool is held weakly: once the pool is dropped or stopped no
/// further pass is scheduled.
pub struct PeriodicCleaner {
    progress: Arc<Progress>,
}

#[derive(Default)]
struct Progress {
    stopped: AtomicBool,
    passes: AtomicUsize,
    removed: AtomicUsize,
}

struct Pass<D: ?Sized, A> {
    pool: Weak<ThreadPool>,
    directory: Arc<D>,
    acceptor: A,
    interval: Duration,
    progress: Arc<Progress>,
}

impl PeriodicCleaner {
    /// Schedule the first pass `interval` from now.
    pub fn start<D, A>(
        pool: &Arc<ThreadPool>,
        directory: Arc<D>,
        interval: Duration,
        acceptor: A,
    ) -> Self
    where
        D: Directory + ?Sized + 'static,
        A: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let progress = Arc::new(Progress::default());
        let pass = Arc::new(Pass {
            pool: Arc::downgrade(pool),
            directory,
            acceptor,
            interval,
            progress: Arc::clone(&progress),
        });
        if !pass.schedule(pool) {
            progress.stopped.store(true, Ordering::SeqCst);
        }
        Self { progress }
    }

    /// [`start`](Self::start) with the interval from `config`.
    pub fn from_config<D, A>(
        pool: &Arc<ThreadPool>,
        directory: Arc<D>,
        config: &CleanerConfig,
        acceptor: A,
    ) -> Self
    where
        D: Directory + ?Sized + 'static,
        A: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::start(pool, directory, Duration::from_millis(config.interval_ms), acceptor)
    }

    /// Schedule no further passes. A pass already running completes.
    pub fn stop(&self) {
        self.progress.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.progress.stopped.load(Ordering::SeqCst)
    }

    /// Completed passes.
    pub fn passes(&self) -> usize {
        self.progress.passes.load(Ordering::SeqCst)
    }

    /// Files removed across all completed passes.
    pub fn removed(&self) -> usize {
        self.progress.removed.load(Ordering::SeqCst)
    }
}

impl Drop for PeriodicCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A scheduled pass. Dropped without running means the pool discarded it.
struct Pending<D: ?Sized, A>(Option<Arc<Pass<D, A>>>);

impl<D: ?Sized, A> Drop for Pending<D, A> {
    fn drop(&mut self) {
        if let Some(pass) = self.0.take() {
            debug!("Thread pool discarded a cleaner pass, periodic cleaner stopping");
            pass.progress.stopped.store(true, Ordering::SeqCst);
        }
    }
}

impl<D, A> Pass<D, A>
where
    D: Directory + ?Sized + 'static,
    A: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn schedule(self: &Arc<Self>, pool: &ThreadPool) -> bool {
        let mut pending = Pending(Some(Arc::clone(self)));
        pool.run(
            move || {
                if let Some(pass) = pending.0.take() {
                    pass.run();
                }
            },
            self.interval,
        )
    }

    fn run(self: Arc<Self>) {
        if self.progress.stopped.load(Ordering::SeqCst) {
            return;
        }

        let removed = directory_cleaner::clean(&*self.directory, &self.acceptor);
        self.progress.removed.fetch_add(removed, Ordering::SeqCst);
        let passes = self.progress.passes.fetch_add(1, Ordering::SeqCst) + 1;
        if removed > 0 {
            info!(removed, passes, "Cleaner pass reclaimed files");
        }

        if self.progress.stopped.load(Ordering::SeqCst) {
            return;
        }
        let rescheduled = self.pool.upgrade().is_some_and(|pool| self.schedule(&pool));
        if !rescheduled {
            debug!(passes, "Thread pool unavailable, periodic cleaner stopping");
            self.progress.stopped.store(true, Ordering::SeqCst);
        }
    }
}
