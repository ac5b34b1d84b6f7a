//! Continuation Stack
//!
//! The interpreter never uses the host call stack for sequencing.
//! Every pending continuation lives in an explicit frame stack owned
//! by the fiber, so a fiber can be parked, migrated between worker
//! threads, and resumed without unwinding anything on the host.
//!
//! Frames come in two kinds: continuations (`Apply`, `Fold`) that
//! consume a value or a cause, and sentinels that restore a region
//! stack (interrupt mask, daemon mask, environment, executor) when
//! crossed. Unwinding on failure pops sentinels for their side effect
//! but never treats them as error handlers.

use crate::node::{Cont, FailCont};

/// A single frame on the continuation stack.
pub(crate) enum Frame {
    /// Apply a success continuation to the current value.
    Apply(Cont),
    /// A unified handler: `failure` catches an unwinding cause,
    /// `success` consumes a value.
    Fold { failure: FailCont, success: Cont },
    /// Exit of an `InterruptStatus` region: pop the interrupt mask.
    InterruptRegionExit,
    /// Exit of a `DaemonStatus` region: pop the daemon mask.
    DaemonRegionExit,
    /// Exit of a `Provide` region: pop the environment stack.
    EnvPop,
    /// Exit of a `Lock` region: pop the executor stack.
    ExecutorPop,
}

impl Frame {
    /// Sentinels maintain region stacks; they are not handlers.
    #[allow(dead_code)] // Diagnostic helper; exercised in tests
    pub(crate) fn is_sentinel(&self) -> bool {
        matches!(
            self,
            Frame::InterruptRegionExit | Frame::DaemonRegionExit | Frame::EnvPop | Frame::ExecutorPop
        )
    }
}

/// Growable frame stack with a small pre-allocated backing buffer.
pub(crate) struct ContStack {
    frames: Vec<Frame>,
}

impl ContStack {
    /// Frames reserved up front; growth past this doubles.
    const INITIAL_CAPACITY: usize = 16;

    pub(crate) fn new() -> Self {
        Self {
            frames: Vec::with_capacity(Self::INITIAL_CAPACITY),
        }
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{boxed, Repr};

    #[test]
    fn test_push_pop_order() {
        let mut stack = ContStack::new();
        stack.push(Frame::EnvPop);
        stack.push(Frame::InterruptRegionExit);
        assert_eq!(stack.len(), 2);

        assert!(matches!(stack.pop(), Some(Frame::InterruptRegionExit)));
        assert!(matches!(stack.pop(), Some(Frame::EnvPop)));
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_sentinel_classification() {
        assert!(Frame::InterruptRegionExit.is_sentinel());
        assert!(Frame::DaemonRegionExit.is_sentinel());
        assert!(Frame::EnvPop.is_sentinel());
        assert!(Frame::ExecutorPop.is_sentinel());
        assert!(!Frame::Apply(Box::new(|_| Repr::Succeed(boxed(())))).is_sentinel());
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut stack = ContStack::new();
        for _ in 0..(ContStack::INITIAL_CAPACITY * 4) {
            stack.push(Frame::EnvPop);
        }
        assert_eq!(stack.len(), ContStack::INITIAL_CAPACITY * 4);
    }
}
