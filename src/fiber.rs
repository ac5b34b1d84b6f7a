//! # Fiber State Machine
//!
//! A fiber is a lightweight, interruptible unit of execution. This
//! module holds the shared, concurrently-accessed half of a fiber: the
//! `Executing`/`Done` state record with its observers and accumulated
//! interruption, the async epoch counter, and the supervision links
//! (parent pointer, child set).
//!
//! The loop-owned half (the continuation stack, region stacks, and
//! fiber-ref map) lives in [`RunState`] and is only ever touched by
//! the one worker currently running the fiber. It parks in `run`
//! between scheduling turns.
//!
//! ## Locking
//!
//! `state` is always acquired before `run`. Critical sections are a
//! few loads and stores; everything long-running happens outside the
//! locks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::environment::Environment;
use crate::executor::Executor;
use crate::node::{DynCause, ExitRepr, FiberRefToken, Repr, Value};
use crate::platform::Platform;
use crate::stack::ContStack;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// The "no fiber" identity, used when an interruption is not
    /// attributable to a fiber (for example queue shutdown).
    pub const NONE: FiberId = FiberId(0);

    /// Create a fiber ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub(crate) fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// One-shot callback invoked with the fiber's exit when it completes.
pub(crate) type Observer = Box<dyn FnOnce(ExitRepr) + Send>;

/// Where an executing fiber currently stands.
pub(crate) enum Status {
    /// Holding a worker thread (or queued to get one).
    Running,
    /// Parked on an async callback.
    Suspended {
        interruptible: bool,
        epoch: u64,
        blocking_on: Vec<FiberId>,
    },
}

/// The shared state record of a fiber.
pub(crate) enum FiberState {
    /// Still going. Observers fire on completion; `interrupted`
    /// accumulates every interruption requested so far.
    Executing {
        status: Status,
        observers: Vec<Observer>,
        interrupted: DynCause,
    },
    /// Terminal. No further transitions.
    Done(ExitRepr),
}

/// Read-only view of a fiber's lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing on (or queued for) a worker.
    Running,
    /// Parked on an async callback.
    Suspended,
    /// Completed.
    Done,
}

/// Read-only snapshot of a fiber, produced by the `Descriptor` node.
#[derive(Clone)]
pub struct FiberDescriptor {
    /// The fiber's identity.
    pub id: FiberId,
    /// Lifecycle phase at snapshot time.
    pub status: FiberStatus,
    /// Fibers that have requested interruption of this fiber.
    pub interruptors: HashSet<FiberId>,
    /// Whether interruption was unmasked at snapshot time.
    pub interruptible: bool,
    /// Supervised children at snapshot time.
    pub children: Vec<FiberId>,
    /// The executor the fiber is running on.
    pub executor: Arc<Executor>,
}

impl fmt::Debug for FiberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDescriptor")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("interruptors", &self.interruptors)
            .field("interruptible", &self.interruptible)
            .field("children", &self.children)
            .finish()
    }
}

// ============================================================================
// Fiber refs
// ============================================================================

/// One fiber's slot for a fiber ref.
#[derive(Clone)]
pub(crate) struct RefSlot {
    pub value: Value,
    pub token: FiberRefToken,
}

/// The per-fiber map of fiber-ref slots.
///
/// Values are shared pointers, so the copy-on-fork snapshot is
/// structural sharing, not a deep copy.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    slots: HashMap<u64, RefSlot>,
}

impl FiberRefs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current value of a ref in this fiber, or its initial value.
    pub(crate) fn get(&self, token: &FiberRefToken) -> Value {
        self.slots
            .get(&token.id)
            .map(|slot| slot.value.clone())
            .unwrap_or_else(|| token.initial.clone())
    }

    pub(crate) fn set(&mut self, token: &FiberRefToken, value: Value) {
        self.slots.insert(
            token.id,
            RefSlot {
                value,
                token: token.clone(),
            },
        );
    }

    /// Snapshot handed to a forked child.
    pub(crate) fn fork_snapshot(&self) -> Self {
        self.clone()
    }

    /// Fold a joined child's slots into this fiber via each ref's
    /// combine function.
    pub(crate) fn merge_child(&mut self, child: &FiberRefs) {
        for slot in child.slots.values() {
            let current = self.get(&slot.token);
            let merged = (slot.token.combine)(current, slot.value.clone());
            self.set(&slot.token, merged);
        }
    }
}

// ============================================================================
// Run state
// ============================================================================

/// The loop-owned half of a fiber.
///
/// Exactly one thread touches a `RunState` at a time: the worker
/// currently running the fiber. Between turns it parks in
/// [`Fiber::run`].
pub(crate) struct RunState {
    /// The node about to be dispatched, when parked.
    pub cur: Option<Repr>,
    /// Pending continuations and region sentinels.
    pub stack: ContStack,
    /// Environment region stack; the head is the current record.
    pub env: Vec<Environment>,
    /// Executor region stack; the head is where turns are submitted.
    pub executors: Vec<Arc<Executor>>,
    /// Interrupt mask region stack; the head is "interruptible?".
    pub interrupt_mask: Vec<bool>,
    /// Daemon mask region stack; the head is "fork daemons?".
    pub daemon_mask: Vec<bool>,
    /// This fiber's fiber-ref slots.
    pub refs: FiberRefs,
}

impl RunState {
    pub(crate) fn new(
        cur: Repr,
        env: Environment,
        executor: Arc<Executor>,
        daemon: bool,
        refs: FiberRefs,
    ) -> Self {
        Self {
            cur: Some(cur),
            stack: ContStack::new(),
            env: vec![env],
            executors: vec![executor],
            interrupt_mask: vec![true],
            daemon_mask: vec![daemon],
            refs,
        }
    }

    /// Whether interruption is currently unmasked.
    pub(crate) fn interruptible(&self) -> bool {
        *self.interrupt_mask.last().unwrap_or(&true)
    }

    /// Whether forks currently create daemon fibers.
    pub(crate) fn daemon(&self) -> bool {
        *self.daemon_mask.last().unwrap_or(&false)
    }

    /// The executor turns are currently submitted to.
    ///
    /// The stack is pushed/popped only in balanced `Lock` regions, so
    /// the root entry is always present.
    pub(crate) fn executor(&self) -> Arc<Executor> {
        self.executors
            .last()
            .expect("executor region stack underflow")
            .clone()
    }

    /// The current environment record.
    pub(crate) fn environment(&self) -> Environment {
        self.env.last().cloned().unwrap_or_default()
    }
}

// ============================================================================
// Fiber
// ============================================================================

/// The shared half of a fiber.
pub(crate) struct Fiber {
    id: FiberId,
    /// Platform the fiber was launched under.
    pub(crate) platform: Arc<Platform>,
    /// State record. Lock order: `state` before `run`.
    state: Mutex<FiberState>,
    /// Monotonic async round counter; stale resumes compare against it.
    epoch: AtomicU64,
    /// Mirror of "accumulated interruption is non-empty", so the hot
    /// loop can poll without taking the state lock.
    interrupt_pending: AtomicBool,
    /// Parked run state between scheduling turns.
    pub(crate) run: Mutex<Option<Box<RunState>>>,
    /// Supervising parent, if any. Cleared at completion.
    pub(crate) parent: Mutex<Option<Weak<Fiber>>>,
    /// Supervised children, weakly held.
    pub(crate) children: Mutex<HashMap<FiberId, Weak<Fiber>>>,
    /// Whether this fiber is tracked by the daemon registry.
    pub(crate) daemon: bool,
    /// Final fiber-ref map, published at completion for inheritance.
    final_refs: Mutex<Option<FiberRefs>>,
}

impl Fiber {
    pub(crate) fn new(platform: Arc<Platform>, daemon: bool) -> Arc<Self> {
        Arc::new(Self {
            id: next_fiber_id(),
            platform,
            state: Mutex::new(FiberState::Executing {
                status: Status::Running,
                observers: Vec::new(),
                interrupted: DynCause::Empty,
            }),
            epoch: AtomicU64::new(0),
            interrupt_pending: AtomicBool::new(false),
            run: Mutex::new(None),
            parent: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
            daemon,
            final_refs: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Allocate the next async epoch for this fiber.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether any interruption has been requested.
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt_pending.load(Ordering::Acquire)
    }

    /// The accumulated interruption cause.
    pub(crate) fn interrupt_cause(&self) -> DynCause {
        match &*self.state.lock() {
            FiberState::Executing { interrupted, .. } => interrupted.clone(),
            FiberState::Done(_) => DynCause::Empty,
        }
    }

    /// Register a completion observer. A late observer fires
    /// immediately on the caller's thread.
    pub(crate) fn on_done(&self, observer: Observer) {
        let exit = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberState::Executing { observers, .. } => {
                    observers.push(observer);
                    return;
                }
                FiberState::Done(exit) => exit.clone(),
            }
        };
        observer(exit);
    }

    /// Non-blocking completion check.
    pub(crate) fn poll(&self) -> Option<ExitRepr> {
        match &*self.state.lock() {
            FiberState::Executing { .. } => None,
            FiberState::Done(exit) => Some(exit.clone()),
        }
    }

    /// Park the fiber on an async callback for the given epoch.
    ///
    /// Refuses (returns false) when the fiber is interruptible and an
    /// interruption is already pending, so a request landing just
    /// before the park cannot be lost. The refusal and the park are
    /// one critical section.
    pub(crate) fn try_suspend(
        &self,
        interruptible: bool,
        epoch: u64,
        blocking_on: Vec<FiberId>,
    ) -> bool {
        let mut state = self.state.lock();
        if let FiberState::Executing {
            status,
            interrupted,
            ..
        } = &mut *state
        {
            if interruptible && !interrupted.is_empty() {
                return false;
            }
            *status = Status::Suspended {
                interruptible,
                epoch,
                blocking_on,
            };
            return true;
        }
        false
    }

    /// Transition `Suspended(epoch)` back to `Running`.
    ///
    /// Returns false for stale epochs, double resumes, or completed
    /// fibers. This is the exactly-one-wakeup guarantee of async rounds.
    pub(crate) fn try_resume(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if let FiberState::Executing { status, .. } = &mut *state {
            if matches!(status, Status::Suspended { epoch: e, .. } if *e == epoch) {
                *status = Status::Running;
                return true;
            }
        }
        false
    }

    /// Merge an interruption cause into the accumulated record.
    ///
    /// If the fiber was suspended interruptible, it is transitioned to
    /// `Running` and handed a synthetic failure to resume with; the
    /// caller must then submit it. Returns the node to resume with in
    /// that case.
    pub(crate) fn add_interrupt_cause(&self, cause: DynCause) -> Option<Repr> {
        if cause.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        match &mut *state {
            FiberState::Done(_) => None,
            FiberState::Executing {
                status,
                interrupted,
                ..
            } => {
                let merged = std::mem::replace(interrupted, DynCause::Empty).then(cause);
                *interrupted = merged;
                self.interrupt_pending.store(true, Ordering::Release);
                match status {
                    Status::Suspended {
                        interruptible: true,
                        ..
                    } => {
                        *status = Status::Running;
                        Some(Repr::Fail(interrupted.clone()))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Union each ancestor's accumulated interruption into this fiber.
    ///
    /// Runs at the start of every scheduling turn; this is how an
    /// interrupt-pending ancestor reaches a running descendant
    /// cooperatively.
    pub(crate) fn propagate_ancestor_interruption(self: &Arc<Self>) {
        let mut current = self.parent.lock().clone();
        while let Some(weak) = current {
            let Some(ancestor) = weak.upgrade() else { break };
            if ancestor.interrupt_pending() {
                let ancestor_cause = ancestor.interrupt_cause();
                let known = self.interrupt_cause().interruptors();
                let incoming = ancestor_cause.interruptors();
                if !incoming.is_subset(&known) {
                    // Already running, so no wakeup node is produced.
                    let _ = self.add_interrupt_cause(ancestor_cause);
                }
            }
            current = ancestor.parent.lock().clone();
        }
    }

    /// Transition to `Done` exactly once.
    ///
    /// Returns the registered observers for the caller to notify, or
    /// `None` if the fiber was already done.
    pub(crate) fn set_done(&self, exit: ExitRepr) -> Option<Vec<Observer>> {
        let mut state = self.state.lock();
        match &mut *state {
            FiberState::Done(_) => None,
            FiberState::Executing { observers, .. } => {
                let observers = std::mem::take(observers);
                *state = FiberState::Done(exit);
                Some(observers)
            }
        }
    }

    /// Publish the final fiber-ref map for later inheritance.
    pub(crate) fn publish_final_refs(&self, refs: FiberRefs) {
        *self.final_refs.lock() = Some(refs);
    }

    /// The final fiber-ref map, if the fiber completed.
    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.final_refs.lock().clone()
    }

    /// Upgrade and collect the live children.
    pub(crate) fn children_snapshot(&self) -> Vec<Arc<Fiber>> {
        self.children
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Build the read-only descriptor snapshot.
    pub(crate) fn descriptor(&self, rs: &RunState) -> FiberDescriptor {
        let (status, interruptors) = {
            let state = self.state.lock();
            match &*state {
                FiberState::Done(_) => (FiberStatus::Done, HashSet::new()),
                FiberState::Executing {
                    status,
                    interrupted,
                    ..
                } => {
                    let view = match status {
                        Status::Running => FiberStatus::Running,
                        Status::Suspended { .. } => FiberStatus::Suspended,
                    };
                    (view, interrupted.interruptors())
                }
            }
        };
        FiberDescriptor {
            id: self.id,
            status,
            interruptors,
            interruptible: rs.interruptible(),
            children: self.children.lock().keys().copied().collect(),
            executor: rs.executor(),
        }
    }

    /// The lifecycle phase, for handles that hold no run state.
    pub(crate) fn status_view(&self) -> FiberStatus {
        match &*self.state.lock() {
            FiberState::Done(_) => FiberStatus::Done,
            FiberState::Executing { status, .. } => match status {
                Status::Running => FiberStatus::Running,
                Status::Suspended { .. } => FiberStatus::Suspended,
            },
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("daemon", &self.daemon)
            .field("status", &self.status_view())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::boxed;
    use crate::platform::Platform;
    use std::sync::atomic::AtomicU32;

    fn test_fiber() -> Arc<Fiber> {
        Fiber::new(Arc::new(Platform::test()), false)
    }

    #[test]
    fn test_fiber_id_generation() {
        let id1 = next_fiber_id();
        let id2 = next_fiber_id();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
        assert_ne!(id1, FiberId::NONE);
    }

    #[test]
    fn test_epochs_are_monotonic() {
        let fiber = test_fiber();
        let e1 = fiber.next_epoch();
        let e2 = fiber.next_epoch();
        assert!(e2 > e1);
    }

    #[test]
    fn test_suspend_resume_epoch_guard() {
        let fiber = test_fiber();
        let epoch = fiber.next_epoch();
        assert!(fiber.try_suspend(true, epoch, Vec::new()));

        // Stale epoch is refused; current epoch succeeds exactly once.
        assert!(!fiber.try_resume(epoch + 1));
        assert!(fiber.try_resume(epoch));
        assert!(!fiber.try_resume(epoch));
    }

    #[test]
    fn test_done_is_terminal() {
        let fiber = test_fiber();
        assert!(fiber.poll().is_none());

        let exit: ExitRepr = crate::exit::Exit::Success(boxed(1i32));
        assert!(fiber.set_done(exit.clone()).is_some());
        assert!(fiber.set_done(exit).is_none());
        assert!(fiber.poll().is_some());
        assert_eq!(fiber.status_view(), FiberStatus::Done);
    }

    #[test]
    fn test_late_observer_fires_immediately() {
        let fiber = test_fiber();
        fiber.set_done(crate::exit::Exit::Success(boxed(7i32)));

        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        fiber.on_done(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_accumulates() {
        let fiber = test_fiber();
        assert!(!fiber.interrupt_pending());

        assert!(fiber
            .add_interrupt_cause(DynCause::interrupt(FiberId::new(9)))
            .is_none());
        assert!(fiber.interrupt_pending());
        assert!(fiber.interrupt_cause().interrupted());
    }

    #[test]
    fn test_interrupt_wakes_suspended_interruptible() {
        let fiber = test_fiber();
        let epoch = fiber.next_epoch();
        assert!(fiber.try_suspend(true, epoch, Vec::new()));

        let wake = fiber.add_interrupt_cause(DynCause::interrupt(FiberId::new(2)));
        assert!(wake.is_some());
        // The synthetic wakeup consumed the suspension.
        assert!(!fiber.try_resume(epoch));
    }

    #[test]
    fn test_interrupt_does_not_wake_masked() {
        let fiber = test_fiber();
        let epoch = fiber.next_epoch();
        assert!(fiber.try_suspend(false, epoch, Vec::new()));

        let wake = fiber.add_interrupt_cause(DynCause::interrupt(FiberId::new(2)));
        assert!(wake.is_none());
        assert!(fiber.interrupt_pending());
        // Still suspended; the original resume path stays valid.
        assert!(fiber.try_resume(epoch));
    }

    #[test]
    fn test_suspend_refused_when_interrupt_pending() {
        let fiber = test_fiber();
        let _ = fiber.add_interrupt_cause(DynCause::interrupt(FiberId::new(5)));

        assert!(!fiber.try_suspend(true, fiber.next_epoch(), Vec::new()));
        // Masked suspension is still allowed.
        assert!(fiber.try_suspend(false, fiber.next_epoch(), Vec::new()));
    }

    #[test]
    fn test_fiber_refs_merge() {
        let token = FiberRefToken {
            id: 1,
            initial: boxed(0i32),
            combine: Arc::new(|parent, child| {
                let p = crate::node::unbox::<i32>(parent);
                let c = crate::node::unbox::<i32>(child);
                boxed(p.max(c))
            }),
        };

        let mut parent = FiberRefs::new();
        parent.set(&token, boxed(3i32));

        let mut child = parent.fork_snapshot();
        child.set(&token, boxed(8i32));

        parent.merge_child(&child);
        assert_eq!(crate::node::unbox::<i32>(parent.get(&token)), 8);
    }
}
