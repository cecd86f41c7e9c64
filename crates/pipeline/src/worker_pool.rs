//! Thread pool with a bounded task FIFO and optional elastic sizing.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, trace};

/// How long `submit` waits for queue space before giving up.
const SUBMIT_WAIT: Duration = Duration::from_secs(1);
/// How long an idle worker waits for a task before considering eviction.
const TASK_WAIT: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The task queue stayed full for the whole submit wait. The task was
    /// not enqueued; the caller decides whether to retry or drop.
    #[error("worker pool task queue is full")]
    QueueFull,
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Completion handle for a submitted task.
///
/// Resolves when the task finishes; yields `None` if the pool shut down
/// before the task ran.
pub struct TaskHandle<R> {
    rx: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task completes.
    pub fn wait(self) -> Option<R> {
        self.rx.recv().ok()
    }

    /// Block up to `timeout` for the task to complete.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<R> {
        self.rx.recv_timeout(timeout).ok()
    }
}

struct Shared {
    running: AtomicBool,
    /// Workers currently waiting for a task.
    idle: AtomicUsize,
    /// Workers currently registered (waiting or busy).
    workers: AtomicUsize,
    init_size: usize,
    max_size: usize,
    idle_budget: Duration,
    elastic: bool,
}

/// Fixed or elastic pool of long-lived workers fed by a bounded FIFO.
///
/// Fixed mode never changes size. Elastic mode spawns a worker whenever a
/// submission finds more pending tasks than idle workers (up to `max_size`)
/// and lets a worker exit after sitting idle past its budget, never dipping
/// below `init_size`. Dropping the pool disconnects the queue, which wakes
/// every worker, and then joins them all — a worker can neither be left
/// behind nor start a task after shutdown is observed.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tx: Option<Sender<Job>>,
    rx: Receiver<Job>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    /// Pool with a constant `init_size` workers.
    pub fn fixed(init_size: usize, task_capacity: usize) -> Self {
        Self::build(init_size, init_size, task_capacity, Duration::MAX, false)
    }

    /// Pool growing from `init_size` up to `max_size`, evicting workers
    /// idle for longer than `idle_budget`.
    pub fn elastic(
        init_size: usize,
        max_size: usize,
        task_capacity: usize,
        idle_budget: Duration,
    ) -> Self {
        assert!(max_size >= init_size, "max_size must be >= init_size");
        Self::build(init_size, max_size, task_capacity, idle_budget, true)
    }

    fn build(
        init_size: usize,
        max_size: usize,
        task_capacity: usize,
        idle_budget: Duration,
        elastic: bool,
    ) -> Self {
        assert!(init_size > 0, "pool needs at least one worker");
        let (tx, rx) = bounded::<Job>(task_capacity);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            idle: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            init_size,
            max_size,
            idle_budget,
            elastic,
        });

        let pool = Self {
            shared,
            tx: Some(tx),
            rx,
            handles: Mutex::new(Vec::with_capacity(max_size)),
            next_worker_id: AtomicUsize::new(0),
        };
        for _ in 0..init_size {
            pool.spawn_worker();
        }
        pool
    }

    /// Queue a task, waiting up to one second for space.
    ///
    /// On success the returned handle resolves to the task's result. A full
    /// queue is reported as an explicit [`PoolError::QueueFull`]; the task
    /// is not silently replaced by a default result.
    pub fn submit<R, F>(&self, task: F) -> Result<TaskHandle<R>, PoolError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let tx = self.tx.as_ref().ok_or(PoolError::ShuttingDown)?;

        let (result_tx, result_rx) = bounded::<R>(1);
        let job: Job = Box::new(move || {
            let result = task();
            let _ = result_tx.send(result);
        });

        tx.send_timeout(job, SUBMIT_WAIT).map_err(|err| match err {
            SendTimeoutError::Timeout(_) => PoolError::QueueFull,
            SendTimeoutError::Disconnected(_) => PoolError::ShuttingDown,
        })?;

        if self.shared.elastic {
            self.maybe_grow();
        }

        Ok(TaskHandle { rx: result_rx })
    }

    /// Spawn an extra worker when pending tasks outnumber idle workers.
    fn maybe_grow(&self) {
        let pending = self.rx.len();
        let idle = self.shared.idle.load(Ordering::SeqCst);
        loop {
            let workers = self.shared.workers.load(Ordering::SeqCst);
            if pending <= idle || workers >= self.shared.max_size {
                return;
            }
            // Reserve the slot before spawning so concurrent submits cannot
            // overshoot max_size.
            if self
                .shared
                .workers
                .compare_exchange(workers, workers + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spawn_reserved_worker();
                return;
            }
        }
    }

    fn spawn_worker(&self) {
        self.shared.workers.fetch_add(1, Ordering::SeqCst);
        self.spawn_reserved_worker();
    }

    /// Spawn a worker whose registry slot is already counted.
    fn spawn_reserved_worker(&self) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        let rx = self.rx.clone();

        let handle = thread::Builder::new()
            .name(format!("pool-worker-{id}"))
            .spawn(move || worker_loop(id, shared, rx))
            .expect("failed to spawn pool worker");

        self.handles.lock().unwrap().push(handle);
    }

    /// Workers currently registered.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Workers currently waiting for a task.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Tasks queued but not yet claimed by a worker.
    pub fn pending_tasks(&self) -> usize {
        self.rx.len()
    }

    /// Stop accepting tasks, wake every worker, and join them all.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        // Disconnecting the channel wakes all workers blocked on recv.
        self.tx = None;

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>, rx: Receiver<Job>) {
    trace!("worker {id} started");
    let mut idle_since = Instant::now();

    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = rx.recv_timeout(TASK_WAIT);
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(job) => {
                // A task claimed after shutdown was observed must not run.
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                job();
                idle_since = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                if shared.elastic && idle_since.elapsed() >= shared.idle_budget {
                    if try_release_slot(&shared) {
                        debug!("worker {id} idled out");
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.workers.fetch_sub(1, Ordering::SeqCst);
    trace!("worker {id} exited");
}

/// Give up this worker's registry slot unless that would drop the pool
/// below its initial size.
fn try_release_slot(shared: &Shared) -> bool {
    loop {
        let workers = shared.workers.load(Ordering::SeqCst);
        if workers <= shared.init_size {
            return false;
        }
        if shared
            .workers
            .compare_exchange(workers, workers - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fixed_pool_runs_tasks_and_returns_results() {
        let pool = WorkerPool::fixed(2, 8);
        let handles: Vec<_> = (0..8)
            .map(|i| pool.submit(move || i * 2).unwrap())
            .collect();
        let mut results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn full_queue_is_an_explicit_error() {
        let pool = WorkerPool::fixed(1, 1);
        let gate = Arc::new(AtomicBool::new(false));

        // Occupy the single worker.
        let blocker = {
            let gate = gate.clone();
            pool.submit(move || {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap()
        };
        // Give the worker time to claim the blocking task, then fill the
        // queue slot.
        thread::sleep(Duration::from_millis(50));
        let _queued = pool.submit(|| ()).unwrap();

        let started = Instant::now();
        let overflow = pool.submit(|| ());
        assert!(matches!(overflow, Err(PoolError::QueueFull)));
        assert!(started.elapsed() >= Duration::from_millis(900));

        gate.store(true, Ordering::SeqCst);
        blocker.wait().unwrap();
    }

    #[test]
    fn elastic_pool_grows_under_burst_and_respects_max() {
        let pool = WorkerPool::elastic(2, 4, 16, Duration::from_secs(60));
        let gate = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                pool.submit(move || {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                })
                .unwrap()
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        let grown = pool.worker_count();
        assert!(grown > 2, "pool should have grown, got {grown}");
        assert!(grown <= 4, "pool must not exceed max, got {grown}");

        gate.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.wait().unwrap();
        }
    }

    #[test]
    fn elastic_pool_evicts_back_to_init_size() {
        let mut pool = WorkerPool::elastic(1, 4, 16, Duration::from_millis(100));
        let gate = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                pool.submit(move || {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                })
                .unwrap()
            })
            .collect();
        thread::sleep(Duration::from_millis(100));
        assert!(pool.worker_count() > 1);

        gate.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.wait().unwrap();
        }

        // Idle budget (100 ms) + one task-wait period (1 s) + slack.
        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline && pool.worker_count() > 1 {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(pool.worker_count(), 1);

        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn shutdown_joins_all_workers_and_rejects_new_tasks() {
        let mut pool = WorkerPool::fixed(3, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let counter = counter.clone();
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert!(matches!(pool.submit(|| ()), Err(PoolError::ShuttingDown)));
    }

    #[test]
    fn no_task_starts_after_shutdown_is_observed() {
        // Enqueue more tasks than can start, then shut down immediately;
        // the executed count must never grow after shutdown returns.
        let mut pool = WorkerPool::fixed(1, 16);
        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let executed = executed.clone();
            let _ = pool.submit(move || {
                executed.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
            });
        }
        pool.shutdown();
        let after_shutdown = executed.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(executed.load(Ordering::SeqCst), after_shutdown);
    }
}
