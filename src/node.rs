//! # Reified Effect Tree
//!
//! The interpreter dispatches on a finite, type-erased node enum. The
//! typed [`Effect`](crate::effect::Effect) facade builds these nodes
//! and guarantees that every boxed value is downcast back at the exact
//! type it was boxed with.
//!
//! Values travel the tree as `Arc<dyn Any + Send + Sync>` so that a
//! terminal [`Exit`](crate::exit::Exit) can be shared with any number
//! of observers without copying the payload.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::cause::Cause;
use crate::environment::Environment;
use crate::executor::Executor;
use crate::fiber::{Fiber, FiberDescriptor, FiberId};
use crate::platform::Platform;

/// Bound required of values and errors that flow through effects.
///
/// Cloning is what lets a single exit be observed by many fibers;
/// wrap expensive payloads in `Arc` to make the clone cheap.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// A type-erased success value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// A type-erased typed error.
pub(crate) type ErrorValue = Arc<dyn Any + Send + Sync>;

/// The cause type used inside the interpreter.
pub(crate) type DynCause = Cause<ErrorValue>;

/// The exit type used inside the interpreter.
pub(crate) type ExitRepr = crate::exit::Exit<Value, ErrorValue>;

/// Erase a value.
pub(crate) fn boxed<A: Send + Sync + 'static>(value: A) -> Value {
    Arc::new(value)
}

/// Recover a value erased by [`boxed`].
///
/// The typed facade constructs every continuation at the type its
/// input was boxed with, so a mismatch here is a bug in this crate,
/// not in user code.
pub(crate) fn unbox<A: Clone + Send + Sync + 'static>(value: Value) -> A {
    let arc = value
        .downcast::<A>()
        .expect("effect value type mismatch; continuation applied at the wrong type");
    Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())
}

/// Callback handed to an async `register` function; invoking it
/// resumes the suspended fiber with the given node. Resumes are
/// one-shot: the fiber's async epoch discards late or repeated calls.
pub(crate) type ResumeFn = Arc<dyn Fn(Repr) + Send + Sync>;

/// A success continuation.
pub(crate) type Cont = Box<dyn FnOnce(Value) -> Repr + Send>;

/// A failure continuation.
pub(crate) type FailCont = Box<dyn FnOnce(DynCause) -> Repr + Send>;

/// A race winner/loser continuation: the winner's exit and a handle to
/// the still-running loser.
pub(crate) type RaceCont = Box<dyn FnOnce(ExitRepr, Arc<Fiber>) -> Repr + Send>;

/// Merge function of a fiber ref, applied on join.
pub(crate) type Combine = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Identity and defaults of a fiber ref.
///
/// The token is the ref: any fiber holding it can read or write its
/// own slot, falling back to `initial` when no slot exists yet.
#[derive(Clone)]
pub(crate) struct FiberRefToken {
    /// Allocation-unique identity.
    pub id: u64,
    /// Value seen by fibers that never wrote the ref.
    pub initial: Value,
    /// Parent/child merge applied when a child is joined.
    pub combine: Combine,
}

/// A point-in-time view of where execution stands, produced by the
/// `CaptureTrace` node.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    /// The fiber that captured the trace.
    pub fiber_id: FiberId,
    /// Continuation frames pending at capture time.
    pub stack_depth: usize,
    /// Supervising ancestors, nearest first.
    pub ancestry: Vec<FiberId>,
}

impl fmt::Display for ExecutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (depth {}, {} ancestor(s))",
            self.fiber_id,
            self.stack_depth,
            self.ancestry.len()
        )
    }
}

/// The node kinds the interpreter dispatches on.
///
/// Every public combinator reduces to these. The set is closed: the
/// interpreter's match is exhaustive and has no virtual dispatch.
pub(crate) enum Repr {
    /// A pure value.
    Succeed(Value),
    /// A suspended side effect that cannot fail in the typed channel.
    EffectTotal(Box<dyn FnOnce() -> Value + Send>),
    /// A suspended side effect with a typed error channel.
    EffectPartial(Box<dyn FnOnce() -> Result<Value, ErrorValue> + Send>),
    /// Terminate with a cause.
    Fail(DynCause),
    /// Sequencing: run the inner node, feed its value to the
    /// continuation.
    FlatMap(Box<Repr>, Cont),
    /// Unified error/success continuation; the failure arm is an
    /// unwind handler.
    Fold {
        inner: Box<Repr>,
        failure: FailCont,
        success: Cont,
    },
    /// Region in which interruption is unmasked (`true`) or masked
    /// (`false`).
    InterruptStatus(bool, Box<Repr>),
    /// Observe the current interruptibility.
    CheckInterrupt(Box<dyn FnOnce(bool) -> Repr + Send>),
    /// Suspend until the resume callback is invoked. `register` may
    /// instead return a node to continue with synchronously.
    Async {
        register: Box<dyn FnOnce(ResumeFn) -> Option<Repr> + Send>,
        blocking_on: Vec<FiberId>,
    },
    /// Start a new fiber running the inner node; continues with a
    /// handle to it.
    Fork(Box<Repr>),
    /// Region in which forked children are daemons (`true`) or
    /// supervised (`false`).
    DaemonStatus(bool, Box<Repr>),
    /// Observe the current daemon flag.
    CheckDaemon(Box<dyn FnOnce(bool) -> Repr + Send>),
    /// Observe this fiber's descriptor.
    Descriptor(Box<dyn FnOnce(FiberDescriptor) -> Repr + Send>),
    /// Run the inner node on the given executor, restoring the
    /// previous executor afterwards.
    Lock(Arc<Executor>, Box<Repr>),
    /// Cooperative reschedule point.
    YieldNow,
    /// Read the current environment.
    Access(Box<dyn FnOnce(Environment) -> Repr + Send>),
    /// Replace the environment for the inner node.
    Provide(Environment, Box<Repr>),
    /// Allocate a fiber ref in the current fiber.
    FiberRefMake { initial: Value, combine: Combine },
    /// Read-modify-write a fiber ref slot of the current fiber.
    FiberRefModify {
        token: FiberRefToken,
        update: Box<dyn FnOnce(Value) -> (Value, Value) + Send>,
    },
    /// Merge a completed fiber's ref map into the current fiber.
    InheritRefs(Arc<Fiber>),
    /// Concurrent race with winner/loser continuations.
    RaceWith {
        left: Box<Repr>,
        right: Box<Repr>,
        on_left: RaceCont,
        on_right: RaceCont,
    },
    /// Defer node construction until execution.
    Suspend(Box<dyn FnOnce(&Platform, FiberId) -> Repr + Send>),
    /// Capture the current execution trace.
    CaptureTrace(Box<dyn FnOnce(ExecutionTrace) -> Repr + Send>),
}

impl Repr {
    /// Stable tag name, for diagnostics only.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Repr::Succeed(_) => "Succeed",
            Repr::EffectTotal(_) => "EffectTotal",
            Repr::EffectPartial(_) => "EffectPartial",
            Repr::Fail(_) => "Fail",
            Repr::FlatMap(_, _) => "FlatMap",
            Repr::Fold { .. } => "Fold",
            Repr::InterruptStatus(_, _) => "InterruptStatus",
            Repr::CheckInterrupt(_) => "CheckInterrupt",
            Repr::Async { .. } => "Async",
            Repr::Fork(_) => "Fork",
            Repr::DaemonStatus(_, _) => "DaemonStatus",
            Repr::CheckDaemon(_) => "CheckDaemon",
            Repr::Descriptor(_) => "Descriptor",
            Repr::Lock(_, _) => "Lock",
            Repr::YieldNow => "YieldNow",
            Repr::Access(_) => "Access",
            Repr::Provide(_, _) => "Provide",
            Repr::FiberRefMake { .. } => "FiberRefMake",
            Repr::FiberRefModify { .. } => "FiberRefModify",
            Repr::InheritRefs(_) => "InheritRefs",
            Repr::RaceWith { .. } => "RaceWith",
            Repr::Suspend(_) => "Suspend",
            Repr::CaptureTrace(_) => "CaptureTrace",
        }
    }
}

/// Replay a terminal exit as a node.
pub(crate) fn exit_to_repr(exit: ExitRepr) -> Repr {
    match exit {
        crate::exit::Exit::Success(v) => Repr::Succeed(v),
        crate::exit::Exit::Failure(c) => Repr::Fail(c),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boxed_unbox_roundtrip() {
        let v = boxed(42i64);
        assert_eq!(unbox::<i64>(v), 42);
    }

    #[test]
    fn test_unbox_shared_clones() {
        let v = boxed("shared".to_string());
        let w = v.clone();
        assert_eq!(unbox::<String>(v), "shared");
        assert_eq!(unbox::<String>(w), "shared");
    }

    #[test]
    fn test_tags() {
        assert_eq!(Repr::YieldNow.tag(), "YieldNow");
        assert_eq!(Repr::Succeed(boxed(1u8)).tag(), "Succeed");
    }
}
