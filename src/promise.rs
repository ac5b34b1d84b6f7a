//! Promises
//!
//! A `Promise` is a one-shot cell that starts empty, is completed
//! exactly once, and is permanently readable afterwards. Any number of
//! fibers may await it; they all observe the same exit. An awaiter
//! arriving after completion continues synchronously in its own
//! scheduling turn.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::node::{exit_to_repr, Data, ExitRepr, Repr, ResumeFn};

enum Cell {
    /// Not yet completed; awaiting fibers' resume callbacks.
    Pending(Vec<ResumeFn>),
    /// Completed. Terminal.
    Done(ExitRepr),
}

/// A one-shot awaitable result shared between fibers.
pub struct Promise<A, E = Infallible> {
    cell: Arc<Mutex<Cell>>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Promise<A, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Promise<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.cell.lock() {
            Cell::Pending(waiters) => format!("pending({} waiters)", waiters.len()),
            Cell::Done(_) => "done".to_string(),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<A: Data, E: Data> Promise<A, E> {
    fn empty() -> Self {
        Self {
            cell: Arc::new(Mutex::new(Cell::Pending(Vec::new()))),
            _marker: PhantomData,
        }
    }

    /// Allocate an empty promise.
    pub fn make() -> Effect<Promise<A, E>, E> {
        Effect::total(Self::empty)
    }

    /// Suspend until the promise is completed; replay its exit.
    pub fn await_(&self) -> Effect<A, E> {
        let cell = self.cell.clone();
        Effect::from_repr(Repr::Async {
            register: Box::new(move |resume: ResumeFn| {
                let mut guard = cell.lock();
                match &mut *guard {
                    Cell::Done(exit) => Some(exit_to_repr(exit.clone())),
                    Cell::Pending(waiters) => {
                        waiters.push(resume);
                        None
                    }
                }
            }),
            blocking_on: Vec::new(),
        })
    }

    /// Complete the promise with an exit. Returns false (and does
    /// nothing) if it was already completed.
    pub fn done(&self, exit: Exit<A, E>) -> Effect<bool, E> {
        let this = self.clone();
        Effect::total(move || this.complete(exit.into_repr()))
    }

    /// Complete with a pure value.
    pub fn succeed(&self, value: A) -> Effect<bool, E> {
        self.done(Exit::succeed(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> Effect<bool, E> {
        self.done(Exit::fail(error))
    }

    /// Complete with a defect.
    pub fn die(&self, defect: crate::cause::Defect) -> Effect<bool, E> {
        self.done(Exit::die(defect))
    }

    /// Complete with a full cause.
    pub fn halt(&self, cause: Cause<E>) -> Effect<bool, E> {
        self.done(Exit::halt(cause))
    }

    /// Complete with an interruption attributed to the calling fiber.
    pub fn interrupt(&self) -> Effect<bool, E> {
        let this = self.clone();
        Effect::suspend_with(move |_, my_id| this.interrupt_as(my_id))
    }

    /// Complete with an interruption attributed to `by`.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<bool, E> {
        self.done(Exit::interrupt(by))
    }

    /// The exit, if completed, without suspending.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, E> {
        let cell = self.cell.clone();
        Effect::total(move || match &*cell.lock() {
            Cell::Pending(_) => None,
            Cell::Done(exit) => Some(Exit::from_repr(exit.clone())),
        })
    }

    /// Whether the promise has been completed.
    pub fn is_done(&self) -> Effect<bool, E> {
        let cell = self.cell.clone();
        Effect::total(move || matches!(&*cell.lock(), Cell::Done(_)))
    }

    /// First completion wins; waiters are resumed outside the lock.
    pub(crate) fn complete(&self, exit: ExitRepr) -> bool {
        let waiters = {
            let mut guard = self.cell.lock();
            match &mut *guard {
                Cell::Done(_) => return false,
                Cell::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *guard = Cell::Done(exit.clone());
                    waiters
                }
            }
        };
        for waiter in waiters {
            waiter(exit_to_repr(exit.clone()));
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::boxed;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_complete_exactly_once() {
        let promise: Promise<i32, String> = Promise::empty();
        assert!(promise.complete(ExitRepr::Success(boxed(1i32))));
        assert!(!promise.complete(ExitRepr::Success(boxed(2i32))));
    }

    #[test]
    fn test_waiters_resumed_on_completion() {
        let promise: Promise<i32, String> = Promise::empty();
        let hits = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            let resume: ResumeFn = Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            if let Cell::Pending(waiters) = &mut *promise.cell.lock() {
                waiters.push(resume);
            }
        }

        promise.complete(ExitRepr::Success(boxed(9i32)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_debug_states() {
        let promise: Promise<i32, String> = Promise::empty();
        assert!(format!("{promise:?}").contains("pending"));
        promise.complete(ExitRepr::Success(boxed(1i32)));
        assert!(format!("{promise:?}").contains("done"));
    }
}
