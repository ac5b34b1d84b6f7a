//! # Concurrent Queues
//!
//! MPMC queues connecting fibers, with four admission strategies that
//! differ only in what `offer` does when the buffer is full:
//!
//! - **bounded** (back-pressure): the producer suspends until space
//!   frees up
//! - **dropping**: the new item is rejected, `offer` returns false
//! - **sliding**: the oldest item is evicted to admit the new one
//! - **unbounded**: never full
//!
//! ## Design
//!
//! A FIFO buffer plus two wait lists: suspended takers and (for the
//! back-pressure strategy) suspended producers. Items only ever live
//! in the buffer or in a producer's wait entry, never inside a resume
//! callback: wakeups are retry signals, so a wakeup that goes stale
//! (its fiber was interrupted out of the suspension first) cannot lose
//! an item. An interrupted waiter unregisters itself and, if work is
//! available, wakes the next waiter in line.
//!
//! Surviving items are delivered in FIFO order across any
//! interleaving; a bounded queue never buffers more than its capacity.
//! `shutdown` is idempotent and makes every pending and future
//! operation surface an interruption cause attributed to no fiber.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::fiber::FiberId;
use crate::node::{boxed, unbox, Data, DynCause, Repr, ResumeFn, Value};

/// Admission policy applied by `offer` when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    BackPressure,
    Dropping,
    Sliding,
    Unbounded,
}

/// A parked consumer: a resume callback plus a constructor for the
/// retry effect it is woken with.
struct TakerEntry {
    id: u64,
    resume: ResumeFn,
    retry: Box<dyn FnOnce() -> Repr + Send>,
}

/// A parked producer holding the item it is waiting to admit.
struct PutterEntry {
    id: u64,
    value: Value,
    resume: ResumeFn,
}

struct QueueState {
    items: VecDeque<Value>,
    takers: VecDeque<TakerEntry>,
    putters: VecDeque<PutterEntry>,
    shutdown: bool,
}

struct QueueCore {
    capacity: usize,
    strategy: Strategy,
    next_waiter: AtomicU64,
    state: Mutex<QueueState>,
}

/// A wakeup to deliver after the queue lock is released.
enum Wakeup {
    /// Retry signal for a parked consumer.
    Taker(ResumeFn, Repr),
    /// Admission confirmation for a parked producer.
    Putter(ResumeFn),
}

impl QueueCore {
    fn new(capacity: usize, strategy: Strategy) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            strategy,
            next_waiter: AtomicU64::new(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                takers: VecDeque::new(),
                putters: VecDeque::new(),
                shutdown: false,
            }),
        })
    }

    fn waiter_id(&self) -> u64 {
        self.next_waiter.fetch_add(1, Ordering::Relaxed)
    }

    /// Move waiting producers into freed buffer space.
    fn refill(&self, state: &mut QueueState, wakeups: &mut Vec<Wakeup>) {
        while state.items.len() < self.capacity {
            match state.putters.pop_front() {
                Some(entry) => {
                    state.items.push_back(entry.value);
                    wakeups.push(Wakeup::Putter(entry.resume));
                }
                None => break,
            }
        }
    }

    /// Wake one parked consumer, if any.
    fn wake_taker(state: &mut QueueState, wakeups: &mut Vec<Wakeup>) {
        if let Some(entry) = state.takers.pop_front() {
            let retry = (entry.retry)();
            wakeups.push(Wakeup::Taker(entry.resume, retry));
        }
    }
}

/// Deliver wakeups outside the queue lock.
fn deliver(wakeups: Vec<Wakeup>) {
    for wakeup in wakeups {
        match wakeup {
            Wakeup::Taker(resume, retry) => resume(retry),
            Wakeup::Putter(resume) => resume(Repr::Succeed(boxed(true))),
        }
    }
}

/// The failure every operation surfaces once the queue is shut down.
fn shutdown_repr() -> Repr {
    Repr::Fail(DynCause::interrupt(FiberId::NONE))
}

/// An MPMC queue of `A`.
pub struct Queue<A> {
    core: Arc<QueueCore>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.core.capacity)
            .field("strategy", &self.core.strategy)
            .finish()
    }
}

impl<A: Data> Queue<A> {
    fn with_core(core: Arc<QueueCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// A bounded queue: producers suspend while the buffer is full.
    pub fn bounded<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Effect::total(move || Self::with_core(QueueCore::new(capacity, Strategy::BackPressure)))
    }

    /// A dropping queue: offers to a full buffer return false.
    pub fn dropping<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Effect::total(move || Self::with_core(QueueCore::new(capacity, Strategy::Dropping)))
    }

    /// A sliding queue: a full buffer evicts its oldest item.
    pub fn sliding<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Effect::total(move || Self::with_core(QueueCore::new(capacity, Strategy::Sliding)))
    }

    /// An unbounded queue.
    pub fn unbounded<E: Data>() -> Effect<Queue<A>, E> {
        Effect::total(|| Self::with_core(QueueCore::new(usize::MAX, Strategy::Unbounded)))
    }

    /// The configured capacity (`usize::MAX` when unbounded).
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Offer one item, applying the queue's admission strategy.
    ///
    /// Returns whether the item was admitted. Only the back-pressure
    /// strategy can suspend here; an interrupted producer withdraws
    /// its item.
    pub fn offer<E: Data>(&self, value: A) -> Effect<bool, E> {
        let core = self.core.clone();
        let parked: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let parked_entry = parked.clone();

        let attempt: Effect<bool, E> = Effect::from_repr(Repr::Async {
            register: Box::new(move |resume: ResumeFn| {
                let value = boxed(value);
                let mut wakeups = Vec::new();
                let outcome = {
                    let mut state = core.state.lock();
                    if state.shutdown {
                        Some(shutdown_repr())
                    } else {
                        let admitted = match core.strategy {
                            Strategy::Unbounded => {
                                state.items.push_back(value);
                                Some(true)
                            }
                            Strategy::BackPressure => {
                                if state.items.len() < core.capacity {
                                    state.items.push_back(value);
                                    Some(true)
                                } else {
                                    let id = core.waiter_id();
                                    state.putters.push_back(PutterEntry {
                                        id,
                                        value,
                                        resume,
                                    });
                                    *parked_entry.lock() = Some(id);
                                    None
                                }
                            }
                            Strategy::Dropping => {
                                if state.items.len() < core.capacity {
                                    state.items.push_back(value);
                                    Some(true)
                                } else {
                                    Some(false)
                                }
                            }
                            Strategy::Sliding => {
                                if core.capacity == 0 {
                                    Some(false)
                                } else {
                                    if state.items.len() >= core.capacity {
                                        state.items.pop_front();
                                    }
                                    state.items.push_back(value);
                                    Some(true)
                                }
                            }
                        };
                        // Work became available for a parked consumer
                        // both when the buffer grew and when a
                        // producer parked (rendezvous).
                        match admitted {
                            Some(true) | None => {
                                QueueCore::wake_taker(&mut state, &mut wakeups);
                            }
                            Some(false) => {}
                        }
                        admitted.map(|flag| Repr::Succeed(boxed(flag)))
                    }
                };
                deliver(wakeups);
                outcome
            }),
            blocking_on: Vec::new(),
        });

        let cleanup_core = self.core.clone();
        attempt.on_interrupt(Effect::total(move || {
            if let Some(id) = parked.lock().take() {
                cleanup_core
                    .state
                    .lock()
                    .putters
                    .retain(|entry| entry.id != id);
            }
        }))
    }

    /// Offer a batch, in order, with the queue's admission strategy.
    /// Returns the rejected items (only the dropping strategy rejects).
    pub fn offer_all<E: Data>(&self, values: Vec<A>) -> Effect<Vec<A>, E> {
        fn step<A: Data, E: Data>(
            queue: Queue<A>,
            mut remaining: VecDeque<A>,
            mut rejected: Vec<A>,
        ) -> Effect<Vec<A>, E> {
            match remaining.pop_front() {
                None => Effect::succeed(rejected),
                Some(value) => queue.offer(value.clone()).flat_map(move |admitted| {
                    if !admitted {
                        rejected.push(value);
                    }
                    step(queue, remaining, rejected)
                }),
            }
        }
        step(self.clone(), values.into(), Vec::new())
    }

    /// Take the next item, suspending while the queue is empty.
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        let core = self.core.clone();
        let queue = self.clone();
        let parked: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let parked_entry = parked.clone();

        let attempt: Effect<A, E> = Effect::from_repr(Repr::Async {
            register: Box::new(move |resume: ResumeFn| {
                let mut wakeups = Vec::new();
                let outcome = {
                    let mut state = core.state.lock();
                    if state.shutdown {
                        Some(shutdown_repr())
                    } else if let Some(item) = state.items.pop_front() {
                        core.refill(&mut state, &mut wakeups);
                        Some(Repr::Succeed(item))
                    } else if let Some(entry) = state.putters.pop_front() {
                        // Zero-capacity rendezvous: the consumer pulls
                        // straight from the parked producer.
                        wakeups.push(Wakeup::Putter(entry.resume));
                        Some(Repr::Succeed(entry.value))
                    } else {
                        let id = core.waiter_id();
                        state.takers.push_back(TakerEntry {
                            id,
                            resume,
                            retry: Box::new(move || queue.take::<E>().into_repr()),
                        });
                        *parked_entry.lock() = Some(id);
                        None
                    }
                };
                deliver(wakeups);
                outcome
            }),
            blocking_on: Vec::new(),
        });

        let cleanup_core = self.core.clone();
        attempt.on_interrupt(Effect::total(move || {
            let mut wakeups = Vec::new();
            {
                let mut state = cleanup_core.state.lock();
                if let Some(id) = parked.lock().take() {
                    state.takers.retain(|entry| entry.id != id);
                }
                // If this taker consumed a wakeup before being
                // interrupted, pass the baton.
                if (!state.items.is_empty() || !state.putters.is_empty())
                    && !state.takers.is_empty()
                {
                    QueueCore::wake_taker(&mut state, &mut wakeups);
                }
            }
            deliver(wakeups);
        }))
    }

    /// Take the next item if one is ready, without suspending.
    pub fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        let core = self.core.clone();
        Effect::total(move || {
            let mut wakeups = Vec::new();
            let item = {
                let mut state = core.state.lock();
                if state.shutdown {
                    None
                } else {
                    let item = state.items.pop_front();
                    if item.is_some() {
                        core.refill(&mut state, &mut wakeups);
                    }
                    item
                }
            };
            deliver(wakeups);
            item.map(unbox::<A>)
        })
    }

    /// Snapshot and remove every buffered item, without suspending.
    pub fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    /// Remove up to `n` buffered items, without suspending.
    pub fn take_up_to<E: Data>(&self, n: usize) -> Effect<Vec<A>, E> {
        let core = self.core.clone();
        Effect::total(move || {
            let mut wakeups = Vec::new();
            let taken: Vec<Value> = {
                let mut state = core.state.lock();
                if state.shutdown {
                    Vec::new()
                } else {
                    let count = n.min(state.items.len());
                    let taken: Vec<Value> = state.items.drain(..count).collect();
                    core.refill(&mut state, &mut wakeups);
                    taken
                }
            };
            deliver(wakeups);
            taken.into_iter().map(unbox::<A>).collect()
        })
    }

    /// Number of items currently buffered.
    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        let core = self.core.clone();
        Effect::total(move || core.state.lock().items.len())
    }

    /// Whether the queue has been shut down.
    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        let core = self.core.clone();
        Effect::total(move || core.state.lock().shutdown)
    }

    /// Shut the queue down: buffered items are discarded and every
    /// pending and future operation surfaces an interruption cause.
    /// Idempotent.
    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        let core = self.core.clone();
        Effect::total(move || {
            let (takers, putters) = {
                let mut state = core.state.lock();
                if state.shutdown {
                    return;
                }
                state.shutdown = true;
                state.items.clear();
                (
                    std::mem::take(&mut state.takers),
                    std::mem::take(&mut state.putters),
                )
            };
            for taker in takers {
                (taker.resume)(shutdown_repr());
            }
            for putter in putters {
                (putter.resume)(shutdown_repr());
            }
        })
    }

    /// `offer` discarding the admission flag.
    pub fn offer_unit<E: Data>(&self, value: A) -> Effect<(), E> {
        self.offer(value).as_value(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn raw_counts(queue: &Queue<i32>) -> (usize, usize, usize) {
        let state = queue.core.state.lock();
        (state.items.len(), state.takers.len(), state.putters.len())
    }

    /// Drive an offer's register function directly, bypassing the
    /// interpreter, for state-machine checks.
    fn direct_offer(queue: &Queue<i32>, value: i32) -> Option<bool> {
        let effect: Effect<bool, Infallible> = queue.offer(value);
        let register = find_register(effect.into_repr());
        register(Arc::new(|_| {})).map(|repr| match repr {
            Repr::Succeed(v) => unbox::<bool>(v),
            Repr::Fail(_) => false,
            _ => panic!("unexpected offer outcome"),
        })
    }

    /// Unwrap the interrupt-cleanup layers down to the async node.
    fn find_register(repr: Repr) -> Box<dyn FnOnce(ResumeFn) -> Option<Repr> + Send> {
        match repr {
            Repr::Async { register, .. } => register,
            Repr::InterruptStatus(_, inner) => find_register(*inner),
            Repr::Fold { inner, .. } => find_register(*inner),
            _ => panic!("no async node found"),
        }
    }

    #[test]
    fn test_bounded_admits_up_to_capacity() {
        let queue: Queue<i32> = Queue::with_core(QueueCore::new(2, Strategy::BackPressure));
        assert_eq!(direct_offer(&queue, 1), Some(true));
        assert_eq!(direct_offer(&queue, 2), Some(true));
        // Third producer parks.
        assert_eq!(direct_offer(&queue, 3), None);

        let (items, _, putters) = raw_counts(&queue);
        assert_eq!(items, 2);
        assert_eq!(putters, 1);
    }

    #[test]
    fn test_dropping_rejects_when_full() {
        let queue: Queue<i32> = Queue::with_core(QueueCore::new(1, Strategy::Dropping));
        assert_eq!(direct_offer(&queue, 1), Some(true));
        assert_eq!(direct_offer(&queue, 2), Some(false));
        assert_eq!(raw_counts(&queue).0, 1);
    }

    #[test]
    fn test_sliding_evicts_oldest() {
        let queue: Queue<i32> = Queue::with_core(QueueCore::new(2, Strategy::Sliding));
        assert_eq!(direct_offer(&queue, 1), Some(true));
        assert_eq!(direct_offer(&queue, 2), Some(true));
        assert_eq!(direct_offer(&queue, 3), Some(true));

        let state = queue.core.state.lock();
        let buffered: Vec<i32> = state
            .items
            .iter()
            .map(|v| unbox::<i32>(v.clone()))
            .collect();
        assert_eq!(buffered, vec![2, 3]);
    }

    #[test]
    fn test_unbounded_never_rejects() {
        let queue: Queue<i32> = Queue::with_core(QueueCore::new(usize::MAX, Strategy::Unbounded));
        for i in 0..100 {
            assert_eq!(direct_offer(&queue, i), Some(true));
        }
        assert_eq!(raw_counts(&queue).0, 100);
    }
}
