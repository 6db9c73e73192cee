//! Elastic thread pool
//!
//! A bounded FIFO of tasks drained by a set of worker threads whose size moves
//! between two watermarks:
//!
//! - `start` spawns `low_watermark` workers
//! - `execute` spawns one more worker when queued tasks outnumber idle
//!   workers and fewer than `high_watermark` threads are alive
//! - a worker idle for `idle_time` retires while more than `low_watermark`
//!   threads are alive
//!
//! ```text
//!            start()                stop()               last worker exits
//!  Stopped ──────────▶ Running ──────────────▶ Stopping ──────────────────▶ Stopped
//!                        │  ▲
//!          backlog: grow │  │ idle_time: shrink
//!                        ▼  │
//!               [low_watermark, high_watermark]
//! ```

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, SubmitError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Unit of work accepted by the pool
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Tasks are accepted and executed
    Running,
    /// No new tasks are accepted; queued ones still run
    Stopping,
    /// No threads are alive
    Stopped,
}

/// Watermark-scaled worker pool
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    low_watermark: usize,
    high_watermark: usize,
    max_queue_size: usize,
    idle_time: Duration,

    pool: Mutex<Pool>,
    /// Signalled when a task is queued or the pool starts stopping
    task_available: Condvar,
    /// Signalled when a worker exits
    worker_exited: Condvar,

    spawned: AtomicU64,
    panicked: AtomicU64,
}

struct Pool {
    state: State,
    tasks: VecDeque<Task>,
    threads: usize,
    idle_threads: usize,
}

impl Executor {
    /// Create a stopped pool
    pub fn new(
        name: impl Into<String>,
        low_watermark: usize,
        high_watermark: usize,
        max_queue_size: usize,
        idle_time: Duration,
    ) -> Self {
        let high_watermark = high_watermark.max(1);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                low_watermark: low_watermark.min(high_watermark),
                high_watermark,
                max_queue_size,
                idle_time,
                pool: Mutex::new(Pool {
                    state: State::Stopped,
                    tasks: VecDeque::new(),
                    threads: 0,
                    idle_threads: 0,
                }),
                task_available: Condvar::new(),
                worker_exited: Condvar::new(),
                spawned: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
        }
    }

    /// Create a stopped pool from configuration
    pub fn from_config(name: impl Into<String>, config: &ExecutorConfig) -> Self {
        Self::new(
            name,
            config.low_watermark,
            config.high_watermark,
            config.max_queue_size,
            config.idle_time(),
        )
    }

    /// Start the pool with `low_watermark` workers.
    ///
    /// Waits for a stop in progress to finish before starting again.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let mut pool = inner.pool.lock();
        if pool.state == State::Running {
            return Err(ExecutorError::AlreadyRunning);
        }
        while pool.state != State::Stopped {
            inner.worker_exited.wait(&mut pool);
        }

        pool.state = State::Running;
        for _ in 0..inner.low_watermark {
            if let Err(e) = inner.spawn_worker(&mut pool) {
                // Roll back to a clean stopped pool rather than running under the low watermark
                pool.state = State::Stopping;
                inner.task_available.notify_all();
                if pool.threads == 0 {
                    pool.state = State::Stopped;
                }
                return Err(e);
            }
        }

        debug!(pool = %inner.name, threads = pool.threads, "Executor started");
        Ok(())
    }

    /// Queue a task for execution.
    ///
    /// Never waits for the task to run. Fails when the pool is not running or
    /// the queue already holds `max_queue_size` tasks.
    pub fn execute<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let mut pool = inner.pool.lock();
        if pool.state != State::Running {
            return Err(SubmitError::NotRunning);
        }
        if pool.tasks.len() >= inner.max_queue_size {
            return Err(SubmitError::QueueFull);
        }

        pool.tasks.push_back(Box::new(task));
        if pool.tasks.len() > pool.idle_threads
            && pool.threads < inner.high_watermark
            && let Err(e) = inner.spawn_worker(&mut pool)
        {
            // The task stays queued for the existing workers
            warn!(pool = %inner.name, "Failed to grow pool: {}", e);
        }
        inner.task_available.notify_one();
        Ok(())
    }

    /// Stop accepting tasks; queued and running tasks are completed.
    ///
    /// With `await_termination` the call returns only once every worker has exited.
    pub fn stop(&self, await_termination: bool) {
        let inner = &self.inner;
        let mut pool = inner.pool.lock();
        if pool.state == State::Stopped {
            return;
        }
        if pool.state == State::Running {
            pool.state = State::Stopping;
            inner.task_available.notify_all();
            if pool.threads == 0 {
                Inner::finish_stop(&mut pool, &inner.name);
                inner.worker_exited.notify_all();
            }
        }
        if await_termination {
            while pool.state != State::Stopped {
                inner.worker_exited.wait(&mut pool);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> State {
        self.inner.pool.lock().state
    }

    /// Live worker threads
    pub fn threads(&self) -> usize {
        self.inner.pool.lock().threads
    }

    /// Live worker threads not running a task
    pub fn idle_threads(&self) -> usize {
        self.inner.pool.lock().idle_threads
    }

    pub fn queue_len(&self) -> usize {
        self.inner.pool.lock().tasks.len()
    }

    /// Tasks that panicked while running
    pub fn panicked_tasks(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    pub fn low_watermark(&self) -> usize {
        self.inner.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.inner.high_watermark
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.inner.pool.lock();
        f.debug_struct("Executor")
            .field("name", &self.inner.name)
            .field("state", &pool.state)
            .field("threads", &pool.threads)
            .field("queued", &pool.tasks.len())
            .finish()
    }
}

impl Inner {
    /// Spawn one worker, counted as idle until it picks up a task. Caller holds the lock.
    fn spawn_worker(self: &Arc<Self>, pool: &mut MutexGuard<'_, Pool>) -> Result<(), ExecutorError> {
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || inner.run_worker())?;

        pool.threads += 1;
        pool.idle_threads += 1;
        Ok(())
    }

    fn run_worker(&self) {
        let mut pool = self.pool.lock();
        loop {
            while pool.tasks.is_empty() && pool.state == State::Running {
                let timed_out = self
                    .task_available
                    .wait_for(&mut pool, self.idle_time)
                    .timed_out();
                if timed_out
                    && pool.tasks.is_empty()
                    && pool.state == State::Running
                    && pool.threads > self.low_watermark
                {
                    pool.threads -= 1;
                    pool.idle_threads -= 1;
                    self.worker_exited.notify_all();
                    debug!(pool = %self.name, threads = pool.threads, "Idle worker retired");
                    return;
                }
            }

            if let Some(task) = pool.tasks.pop_front() {
                pool.idle_threads -= 1;
                MutexGuard::unlocked(&mut pool, || self.run_task(task));
                pool.idle_threads += 1;
            } else {
                // Stopping and nothing left to run
                pool.threads -= 1;
                pool.idle_threads -= 1;
                if pool.threads == 0 {
                    Self::finish_stop(&mut pool, &self.name);
                }
                self.worker_exited.notify_all();
                return;
            }
        }
    }

    fn run_task(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(pool = %self.name, "Task panicked: {}", message);
        }
    }

    fn finish_stop(pool: &mut Pool, name: &str) {
        if !pool.tasks.is_empty() {
            warn!(pool = %name, dropped = pool.tasks.len(), "Executor stopped with queued tasks and no workers");
            pool.tasks.clear();
        }
        pool.state = State::Stopped;
        debug!(pool = %name, "Executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_start_spawns_low_watermark() {
        let pool = Executor::new("t-start", 3, 6, 16, Duration::from_secs(10));
        assert_eq!(pool.state(), State::Stopped);
        assert_eq!(pool.threads(), 0);

        pool.start().unwrap();
        assert_eq!(pool.state(), State::Running);
        assert_eq!(pool.threads(), 3);
        assert!(matches!(pool.start(), Err(ExecutorError::AlreadyRunning)));
        assert_eq!(pool.threads(), 3);

        pool.stop(true);
        assert_eq!(pool.state(), State::Stopped);
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_execute_rejected_unless_running() {
        let pool = Executor::new("t-reject", 1, 2, 4, Duration::from_secs(10));
        assert_eq!(pool.execute(|| {}), Err(SubmitError::NotRunning));

        pool.start().unwrap();
        pool.execute(|| {}).unwrap();
        pool.stop(true);
        assert_eq!(pool.execute(|| {}), Err(SubmitError::NotRunning));
    }

    #[test]
    fn test_queue_bound() {
        let pool = Executor::new("t-bound", 1, 1, 2, Duration::from_secs(10));
        pool.start().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        // The only worker is busy, so these two fill the queue
        pool.execute(|| {}).unwrap();
        pool.execute(|| {}).unwrap();
        assert_eq!(pool.queue_len(), 2);
        assert_eq!(pool.execute(|| {}), Err(SubmitError::QueueFull));
        assert_eq!(pool.threads(), 1);

        release_tx.send(()).unwrap();
        pool.stop(true);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_fifo_single_worker() {
        let pool = Executor::new("t-fifo", 1, 1, 128, Duration::from_secs(10));
        pool.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = Arc::clone(&order);
            pool.execute(move || order.lock().push(i)).unwrap();
        }
        pool.stop(true);

        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_accepted_task_runs_once() {
        let pool = Executor::new("t-once", 2, 8, 64, Duration::from_millis(50));
        pool.start().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let mut accepted = 0;
        for _ in 0..1000 {
            let runs = Arc::clone(&runs);
            let task = move || {
                runs.fetch_add(1, Ordering::SeqCst);
            };
            if pool.execute(task).is_ok() {
                accepted += 1;
            } else {
                thread::yield_now();
            }
            assert!(pool.threads() <= 8);
        }
        pool.stop(true);

        assert_eq!(runs.load(Ordering::SeqCst), accepted);
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_grows_on_backlog_and_shrinks_when_idle() {
        let pool = Executor::new("t-elastic", 2, 5, 64, Duration::from_millis(50));
        pool.start().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let release_rx = Arc::clone(&release_rx);
            let started = Arc::clone(&started);
            pool.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.lock().recv();
            })
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) >= 1));
        assert_eq!(pool.threads(), 5);

        for _ in 0..8 {
            release_tx.send(()).unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || pool.threads() == 2));
        assert_eq!(started.load(Ordering::SeqCst), 8);
        assert_eq!(pool.state(), State::Running);

        pool.stop(true);
    }

    #[test]
    fn test_stop_completes_queued_tasks() {
        let pool = Executor::new("t-drain", 1, 1, 64, Duration::from_secs(10));
        pool.start().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let runs = Arc::clone(&runs);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop(true);

        assert_eq!(runs.load(Ordering::SeqCst), 32);
        assert_eq!(pool.state(), State::Stopped);
    }

    #[test]
    fn test_stop_without_await_finishes_asynchronously() {
        let pool = Executor::new("t-async-stop", 2, 2, 8, Duration::from_secs(10));
        pool.start().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

        pool.stop(false);
        assert_eq!(pool.state(), State::Stopping);
        assert_eq!(pool.execute(|| {}), Err(SubmitError::NotRunning));

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.state() == State::Stopped));
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let pool = Executor::new("t-restart", 2, 4, 8, Duration::from_secs(10));
        pool.start().unwrap();
        pool.stop(false);
        // start waits for the asynchronous stop to finish
        pool.start().unwrap();
        assert_eq!(pool.state(), State::Running);
        assert_eq!(pool.threads(), 2);

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.stop(true);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let pool = Executor::new("t-panic", 1, 1, 8, Duration::from_secs(10));
        pool.start().unwrap();

        pool.execute(|| panic!("task failure")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send("still serving").unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still serving");
        assert_eq!(pool.panicked_tasks(), 1);
        assert_eq!(pool.threads(), 1);
        pool.stop(true);
    }

    #[test]
    fn test_zero_low_watermark() {
        let pool = Executor::new("t-lazy", 0, 3, 8, Duration::from_millis(30));
        pool.start().unwrap();
        assert_eq!(pool.threads(), 0);

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.threads() == 0));
        pool.stop(true);
        assert_eq!(pool.state(), State::Stopped);
    }

    #[test]
    fn test_drop_stops_pool() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let pool = Executor::new("t-drop", 1, 2, 8, Duration::from_secs(10));
            pool.start().unwrap();
            for _ in 0..4 {
                let runs = Arc::clone(&runs);
                pool.execute(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }
}
