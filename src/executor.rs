//! # Work-Stealing Executor
//!
//! Runs fiber turns on a pool of worker threads.
//!
//! ## Design
//!
//! - Multiple worker threads each with a local deque
//! - Global injection queue for submissions and overflow
//! - Work-stealing for load balancing
//! - A separate unbounded "blocking" pool that grows on demand, so
//!   effects declared blocking never starve the main pool
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;
use crossbeam_deque::{Injector, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::error;

/// A unit of work: one scheduling turn of a fiber, or one blocking
/// task.
pub(crate) type Runnable = Box<dyn FnOnce() + Send>;

/// Executes runnables on threads and carries the fairness budget for
/// fibers locked to it.
pub struct Executor {
    name: String,
    yield_op_count: usize,
    kind: Kind,
}

enum Kind {
    Pool(PoolHandle),
    Blocking(BlockingHandle),
}

impl Executor {
    /// Create a fixed-size work-stealing pool.
    pub fn pool(name: impl Into<String>, num_workers: usize, yield_op_count: usize) -> Arc<Self> {
        let name = name.into();
        let num_workers = num_workers.max(1);
        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            shutdown: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            active_workers: AtomicUsize::new(0),
        });

        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let mut threads = Vec::with_capacity(num_workers);
        for (i, deque) in deques.into_iter().enumerate() {
            let worker = PoolWorker {
                shared: shared.clone(),
                stealers: stealers.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker.run_loop(deque))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        Arc::new(Self {
            name,
            yield_op_count,
            kind: Kind::Pool(PoolHandle {
                shared,
                threads: Mutex::new(threads),
            }),
        })
    }

    /// Create an unbounded blocking pool.
    ///
    /// Threads are spawned whenever no idle thread is available and
    /// retire after `keep_alive` without work.
    pub fn blocking(name: impl Into<String>, keep_alive: Duration) -> Arc<Self> {
        let (tx, rx) = channel::unbounded::<Runnable>();
        Arc::new(Self {
            name: name.into(),
            // Blocking tasks run to completion; the budget never
            // forces a yield.
            yield_op_count: usize::MAX,
            kind: Kind::Blocking(BlockingHandle {
                tx,
                rx,
                idle: Arc::new(AtomicUsize::new(0)),
                next_thread: AtomicU64::new(0),
                keep_alive,
            }),
        })
    }

    /// The per-fiber op budget before a forced yield.
    pub fn yield_op_count(&self) -> usize {
        self.yield_op_count
    }

    /// The executor's name, used for worker thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a runnable for execution.
    pub(crate) fn submit(&self, task: Runnable) {
        match &self.kind {
            Kind::Pool(pool) => {
                pool.shared.injector.push(task);
                pool.shared.idle_cv.notify_one();
            }
            Kind::Blocking(blocking) => blocking.submit(&self.name, task),
        }
    }

    /// Stop the pool's workers and wait for them to exit.
    ///
    /// Queued tasks that have not started are dropped. Idempotent.
    pub fn shutdown(&self) {
        match &self.kind {
            Kind::Pool(pool) => {
                pool.shared.shutdown.store(true, Ordering::Release);
                pool.shared.idle_cv.notify_all();
                let mut threads = pool.threads.lock();
                for handle in threads.drain(..) {
                    let _ = handle.join();
                }
            }
            Kind::Blocking(_) => {
                // Blocking workers retire on their keep-alive.
            }
        }
    }

    /// Number of workers currently executing or polling for work.
    pub fn active_workers(&self) -> usize {
        match &self.kind {
            Kind::Pool(pool) => pool.shared.active_workers.load(Ordering::Acquire),
            Kind::Blocking(blocking) => blocking.idle.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("yield_op_count", &self.yield_op_count)
            .finish()
    }
}

// ============================================================================
// Fixed pool
// ============================================================================

struct PoolHandle {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    /// Global injection queue.
    injector: Injector<Runnable>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Parking for idle workers.
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    /// Number of workers between startup and exit.
    active_workers: AtomicUsize,
}

struct PoolWorker {
    shared: Arc<PoolShared>,
    stealers: Vec<Stealer<Runnable>>,
}

impl PoolWorker {
    fn run_loop(self, local: Deque<Runnable>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Some(task) = self.find_work(&local) {
                run_task(task);
            } else {
                // No work anywhere; park until a submission arrives.
                let mut guard = self.shared.idle_lock.lock();
                if self.shared.injector.is_empty() && !self.shared.shutdown.load(Ordering::Acquire)
                {
                    self.shared
                        .idle_cv
                        .wait_for(&mut guard, Duration::from_millis(10));
                }
            }
        }

        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Find work: local deque, then global queue, then steal.
    fn find_work(&self, local: &Deque<Runnable>) -> Option<Runnable> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            match self.shared.injector.steal_batch_and_pop(local) {
                crossbeam_deque::Steal::Success(task) => return Some(task),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }

        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    crossbeam_deque::Steal::Success(task) => return Some(task),
                    crossbeam_deque::Steal::Empty => break,
                    crossbeam_deque::Steal::Retry => continue,
                }
            }
        }

        None
    }
}

// ============================================================================
// Blocking pool
// ============================================================================

struct BlockingHandle {
    tx: channel::Sender<Runnable>,
    rx: channel::Receiver<Runnable>,
    /// Threads currently parked in `recv`.
    idle: Arc<AtomicUsize>,
    next_thread: AtomicU64,
    keep_alive: Duration,
}

impl BlockingHandle {
    fn submit(&self, name: &str, task: Runnable) {
        if self.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker(name);
        }
        // The channel is unbounded and the receiver half is owned by
        // the handle, so send cannot fail.
        let _ = self.tx.send(task);
    }

    fn spawn_worker(&self, name: &str) {
        let rx = self.rx.clone();
        let idle = self.idle.clone();
        let keep_alive = self.keep_alive;
        let n = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let _ = thread::Builder::new()
            .name(format!("{name}-blocking-{n}"))
            .spawn(move || loop {
                idle.fetch_add(1, Ordering::AcqRel);
                let received = rx.recv_timeout(keep_alive);
                idle.fetch_sub(1, Ordering::AcqRel);
                match received {
                    Ok(task) => run_task(task),
                    // Idle past the keep-alive: retire.
                    Err(channel::RecvTimeoutError::Timeout) => break,
                    Err(channel::RecvTimeoutError::Disconnected) => break,
                }
            });
    }
}

/// Run one task, keeping the worker alive across panics that escape
/// the runtime's own panic capture.
fn run_task(task: Runnable) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let defect = crate::cause::Defect::from_panic(payload);
        error!("executor task panicked: {}", defect);
    }
}

// ============================================================================
// Tests
// ============================================================================
