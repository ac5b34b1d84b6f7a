//! Delayed-Task Timer
//!
//! A single dedicated thread drives all delayed wakeups. Delivering a
//! task after a duration is the only timing primitive the runtime
//! needs: `sleep` registers an async resume here, and interruption of
//! a sleeping fiber simply lets the eventual firing go stale.
//!
//! Entries are held in a deadline-ordered heap; cancellation flips a
//! shared flag, and cancelled entries are dropped when they surface.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cancel token for a scheduled task.
///
/// Cancelling after the task has fired is a no-op.
#[derive(Debug, Clone)]
pub struct TimerKey {
    cancelled: Arc<AtomicBool>,
}

impl TimerKey {
    /// Prevent the task from firing, if it has not fired yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Box<dyn FnOnce() + Send>,
}

// Heap order: earliest deadline first, insertion order as tiebreak.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse for earliest-first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// The delayed-task scheduler.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start the timer thread.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || timer_loop(loop_shared))
            .expect("failed to spawn timer thread");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Deliver `task` after `delay`. Returns a cancel token.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerKey {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            task: Box::new(task),
        };

        self.shared.queue.lock().push(entry);
        self.shared.cv.notify_one();

        TimerKey { cancelled }
    }

    /// Number of tasks waiting to fire, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop the timer thread. Pending tasks are dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        match queue.peek() {
            None => {
                shared.cv.wait(&mut queue);
            }
            Some(entry) if entry.deadline <= now => {
                let entry = queue.pop().expect("peeked entry vanished");
                drop(queue);
                if !entry.cancelled.load(Ordering::Acquire) {
                    (entry.task)();
                }
                queue = shared.queue.lock();
            }
            Some(entry) => {
                let deadline = entry.deadline;
                shared.cv.wait_until(&mut queue, deadline);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_schedule_fires() {
        let timer = Timer::new("timer-test");
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::new("timer-order");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [(2u32, 60u64), (1, 30), (3, 90)] {
            let order = order.clone();
            timer.schedule(Duration::from_millis(delay), move || {
                order.lock().push(label);
            });
        }

        thread::sleep(Duration::from_millis(400));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let timer = Timer::new("timer-cancel");
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        let key = timer.schedule(Duration::from_millis(30), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        key.cancel();
        assert!(key.is_cancelled());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timer = Timer::new("timer-shutdown");
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        timer.schedule(Duration::from_secs(60), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.pending(), 1);

        timer.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
