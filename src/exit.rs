//! Terminal Fiber Outcomes
//!
//! An `Exit` is the final word on a fiber: it either succeeded with a
//! value or failed with a [`Cause`]. Exits are ordinary values and can
//! be stored, compared, and replayed into new effects.

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;
use crate::node::{boxed, unbox, Data, ExitRepr, Value};

/// The result of running a fiber to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// The fiber produced a value.
    Success(A),
    /// The fiber failed with the given cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// An exit failed with a defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An exit failed with a full cause.
    pub fn halt(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// An exit interrupted by the given fiber.
    pub fn interrupt(by: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(by))
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True when the exit's cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    /// Transform the success channel.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Transform the typed error channel.
    pub fn map_error<E2>(self, f: impl Fn(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.map(&f)),
        }
    }

    /// Collapse the exit with one function per side.
    pub fn fold<B>(self, on_failure: impl FnOnce(Cause<E>) -> B, on_success: impl FnOnce(A) -> B) -> B {
        match self {
            Exit::Success(a) => on_success(a),
            Exit::Failure(c) => on_failure(c),
        }
    }

    /// View the exit as a `Result` over the full cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }
}

impl<A: Data, E: Data> Exit<A, E> {
    /// Erase the exit for the interpreter's untyped channel.
    pub(crate) fn into_repr(self) -> ExitRepr {
        match self {
            Exit::Success(a) => Exit::Success(boxed(a)),
            Exit::Failure(c) => Exit::Failure(c.map(&|e| boxed(e) as Value)),
        }
    }

    /// Recover the typed exit from the interpreter's untyped channel.
    pub(crate) fn from_repr(repr: ExitRepr) -> Self {
        match repr {
            Exit::Success(v) => Exit::Success(unbox::<A>(v)),
            Exit::Failure(c) => Exit::Failure(c.map(&|e| unbox::<E>(e))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_accessors() {
        let exit: Exit<i32, String> = Exit::succeed(5);
        assert!(exit.is_success());
        assert!(!exit.is_failure());
        assert_eq!(exit.value(), Some(&5));
        assert!(exit.cause().is_none());
    }

    #[test]
    fn test_failure_accessors() {
        let exit: Exit<i32, String> = Exit::fail("bad".to_string());
        assert!(exit.is_failure());
        assert!(exit.cause().is_some());
        assert!(!exit.is_interrupted());
    }

    #[test]
    fn test_interrupted() {
        let exit: Exit<i32, String> = Exit::interrupt(FiberId::new(3));
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_map_and_fold() {
        let exit: Exit<i32, String> = Exit::succeed(20);
        let doubled = exit.map(|v| v * 2);
        assert_eq!(doubled.value(), Some(&40));

        let folded = doubled.fold(|_| 0, |v| v);
        assert_eq!(folded, 40);
    }

    #[test]
    fn test_repr_roundtrip() {
        let exit: Exit<i32, String> = Exit::fail("oops".to_string());
        let back = Exit::<i32, String>::from_repr(exit.clone().into_repr());
        assert_eq!(back, exit);

        let exit: Exit<i32, String> = Exit::succeed(11);
        let back = Exit::<i32, String>::from_repr(exit.clone().into_repr());
        assert_eq!(back, exit);
    }
}
