//! # The Evaluation Loop
//!
//! One fiber at a time owns its [`RunState`]; different fibers run in
//! parallel on the executor pool. A scheduling turn takes the run
//! state out of the fiber, dispatches nodes until the fiber suspends,
//! completes, yields, or exhausts its op budget, and parks the run
//! state again.
//!
//! ## Per-iteration invariants
//!
//! 1. If interruption is pending and unmasked, and the current node is
//!    not already a failure, a synthetic failure carrying the
//!    accumulated interrupt cause is dispatched instead.
//! 2. When the op budget is exhausted the fiber is resubmitted to its
//!    executor, preserving fairness.
//! 3. Async suspension publishes an epoch; only the resume carrying
//!    that epoch can wake the fiber, and only once.
//!
//! ## Panic policy
//!
//! User thunks and async `register` closures run under
//! `catch_unwind`. Non-fatal panics become `Die` causes; panics the
//! platform classifies fatal are reported and re-raised, bypassing all
//! effect-level handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cause::Defect;
use crate::environment::Environment;
use crate::executor::Executor;
use crate::fiber::{Fiber, FiberRefs, RunState};
use crate::node::{boxed, DynCause, ExecutionTrace, ExitRepr, Repr, ResumeFn, Value};
use crate::platform::Platform;
use crate::stack::Frame;
use crate::supervisor;

/// What a stack walk decided.
enum Step {
    /// Keep interpreting with this node.
    Next(Repr),
    /// The fiber is done.
    Complete(ExitRepr),
    /// Re-submit to a different executor with this node.
    Shift(Arc<Executor>, Repr),
}

/// Queue one scheduling turn of `fiber` on `executor`.
pub(crate) fn submit_turn(fiber: Arc<Fiber>, executor: Arc<Executor>) {
    executor.submit(Box::new(move || run_turn(fiber)));
}

/// Start a root fiber for the given node.
pub(crate) fn spawn_root(
    platform: Arc<Platform>,
    environment: Environment,
    node: Repr,
) -> Arc<Fiber> {
    let fiber = Fiber::new(platform.clone(), false);
    let executor = platform.executor();
    let rs = RunState::new(node, environment, executor.clone(), false, FiberRefs::new());
    *fiber.run.lock() = Some(Box::new(rs));
    submit_turn(fiber.clone(), executor);
    fiber
}

/// Fork a child fiber inheriting the parent's environment, executor,
/// and a fiber-ref snapshot. Supervision follows the daemon mask.
fn spawn_child(parent: &Arc<Fiber>, rs: &RunState, node: Repr) -> Arc<Fiber> {
    let daemon = rs.daemon();
    let child = Fiber::new(parent.platform.clone(), daemon);
    if daemon {
        supervisor::register_daemon(&child);
    } else {
        supervisor::adopt(parent, &child);
    }
    let child_rs = RunState::new(
        node,
        rs.environment(),
        rs.executor(),
        daemon,
        rs.refs.fork_snapshot(),
    );
    *child.run.lock() = Some(Box::new(child_rs));
    submit_turn(child.clone(), rs.executor());
    child
}

/// One scheduling turn.
pub(crate) fn run_turn(fiber: Arc<Fiber>) {
    let Some(mut rs) = fiber.run.lock().take() else {
        return;
    };
    fiber.propagate_ancestor_interruption();

    let budget = rs.executor().yield_op_count();
    let mut ops: usize = 0;

    let Some(mut cur) = rs.cur.take() else {
        *fiber.run.lock() = Some(rs);
        return;
    };

    loop {
        // Invariant 1: interruption preempts everything but an
        // in-flight failure.
        if fiber.interrupt_pending() && rs.interruptible() && !matches!(cur, Repr::Fail(_)) {
            cur = Repr::Fail(fiber.interrupt_cause());
        }

        // Invariant 2: fairness.
        if ops >= budget {
            rs.cur = Some(cur);
            let executor = rs.executor();
            *fiber.run.lock() = Some(rs);
            submit_turn(fiber, executor);
            return;
        }
        ops += 1;

        match cur {
            Repr::Succeed(value) => {
                let step = continue_with(&fiber, &mut rs, value);
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::EffectTotal(thunk) => match run_total(&fiber, thunk) {
                Ok(value) => {
                    let step = continue_with(&fiber, &mut rs, value);
                    match advance(&fiber, rs, step) {
                        Some((r, n)) => {
                            rs = r;
                            cur = n;
                        }
                        None => return,
                    }
                }
                Err(cause) => cur = Repr::Fail(cause),
            },

            Repr::EffectPartial(thunk) => match run_partial(&fiber, thunk) {
                Ok(value) => {
                    let step = continue_with(&fiber, &mut rs, value);
                    match advance(&fiber, rs, step) {
                        Some((r, n)) => {
                            rs = r;
                            cur = n;
                        }
                        None => return,
                    }
                }
                Err(cause) => cur = Repr::Fail(cause),
            },

            Repr::Fail(cause) => {
                let step = unwind(&fiber, &mut rs, cause);
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::FlatMap(inner, k) => match *inner {
                // Fast path: apply the continuation in place for
                // leaves, skipping a push/pop pair.
                Repr::Succeed(value) => cur = k(value),
                Repr::EffectTotal(thunk) => match run_total(&fiber, thunk) {
                    Ok(value) => cur = k(value),
                    Err(cause) => cur = Repr::Fail(cause),
                },
                Repr::EffectPartial(thunk) => match run_partial(&fiber, thunk) {
                    Ok(value) => cur = k(value),
                    Err(cause) => cur = Repr::Fail(cause),
                },
                inner => {
                    rs.stack.push(Frame::Apply(k));
                    cur = inner;
                }
            },

            Repr::Fold {
                inner,
                failure,
                success,
            } => {
                rs.stack.push(Frame::Fold { failure, success });
                cur = *inner;
            }

            Repr::InterruptStatus(interruptible, inner) => {
                rs.interrupt_mask.push(interruptible);
                rs.stack.push(Frame::InterruptRegionExit);
                cur = *inner;
            }

            Repr::CheckInterrupt(k) => cur = k(rs.interruptible()),

            Repr::DaemonStatus(daemon, inner) => {
                rs.daemon_mask.push(daemon);
                rs.stack.push(Frame::DaemonRegionExit);
                cur = *inner;
            }

            Repr::CheckDaemon(k) => cur = k(rs.daemon()),

            Repr::Descriptor(k) => {
                let descriptor = fiber.descriptor(&rs);
                cur = k(descriptor);
            }

            Repr::Access(k) => cur = k(rs.environment()),

            Repr::Provide(environment, inner) => {
                rs.env.push(environment);
                rs.stack.push(Frame::EnvPop);
                cur = *inner;
            }

            Repr::Lock(executor, inner) => {
                if Arc::ptr_eq(&executor, &rs.executor()) {
                    // Already there; the region is a no-op.
                    cur = *inner;
                } else {
                    rs.executors.push(executor.clone());
                    rs.stack.push(Frame::ExecutorPop);
                    rs.cur = Some(*inner);
                    *fiber.run.lock() = Some(rs);
                    submit_turn(fiber, executor);
                    return;
                }
            }

            Repr::YieldNow => {
                rs.cur = Some(Repr::Succeed(boxed(())));
                let executor = rs.executor();
                *fiber.run.lock() = Some(rs);
                submit_turn(fiber, executor);
                return;
            }

            Repr::Async {
                register,
                blocking_on,
            } => {
                let interruptible = rs.interruptible();
                let epoch = fiber.next_epoch();

                // Park the run state before publishing the
                // suspension, so a wakeup from any thread finds it.
                rs.cur = None;
                *fiber.run.lock() = Some(rs);

                if !fiber.try_suspend(interruptible, epoch, blocking_on) {
                    // An interruption beat the park.
                    rs = fiber
                        .run
                        .lock()
                        .take()
                        .expect("run state missing after refused suspension");
                    cur = Repr::Fail(fiber.interrupt_cause());
                    continue;
                }

                let resume = make_resume(&fiber, epoch);
                match catch_unwind(AssertUnwindSafe(move || register(resume))) {
                    Ok(Some(next)) => {
                        // Eager synchronous continuation; reclaim the
                        // suspension unless a resume already won it.
                        if fiber.try_resume(epoch) {
                            rs = fiber
                                .run
                                .lock()
                                .take()
                                .expect("run state missing after eager resume");
                            cur = next;
                            continue;
                        }
                        return;
                    }
                    Ok(None) => return,
                    Err(payload) => {
                        let defect = classify_panic(&fiber, payload);
                        if fiber.try_resume(epoch) {
                            rs = fiber
                                .run
                                .lock()
                                .take()
                                .expect("run state missing after register panic");
                            cur = Repr::Fail(DynCause::die(defect));
                            continue;
                        }
                        crate::warn!(
                            "async register panicked after resuming {}: {}",
                            fiber.id(),
                            defect
                        );
                        return;
                    }
                }
            }

            Repr::Fork(inner) => {
                let child = spawn_child(&fiber, &rs, *inner);
                let step = continue_with(&fiber, &mut rs, boxed(child));
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::FiberRefMake { initial, combine } => {
                let token = crate::fiber_local::new_token(initial.clone(), combine);
                rs.refs.set(&token, initial);
                let step = continue_with(&fiber, &mut rs, boxed(token));
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::FiberRefModify { token, update } => {
                let old = rs.refs.get(&token);
                let (result, new_value) = update(old);
                rs.refs.set(&token, new_value);
                let step = continue_with(&fiber, &mut rs, result);
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::InheritRefs(child) => {
                if let Some(child_refs) = child.final_refs() {
                    rs.refs.merge_child(&child_refs);
                }
                let step = continue_with(&fiber, &mut rs, boxed(()));
                match advance(&fiber, rs, step) {
                    Some((r, n)) => {
                        rs = r;
                        cur = n;
                    }
                    None => return,
                }
            }

            Repr::RaceWith {
                left,
                right,
                on_left,
                on_right,
            } => {
                // Both contenders run with an interruptible overlay so
                // the loser can be stopped.
                let left_fiber = spawn_child(&fiber, &rs, Repr::InterruptStatus(true, left));
                let right_fiber = spawn_child(&fiber, &rs, Repr::InterruptStatus(true, right));
                let blocking_on = vec![left_fiber.id(), right_fiber.id()];

                let register: Box<dyn FnOnce(ResumeFn) -> Option<Repr> + Send> = {
                    let left_fiber = left_fiber.clone();
                    let right_fiber = right_fiber.clone();
                    Box::new(move |resume: ResumeFn| {
                        let latch = Arc::new(AtomicBool::new(false));
                        {
                            let latch = latch.clone();
                            let resume = resume.clone();
                            let winner = left_fiber.clone();
                            let loser = right_fiber.clone();
                            left_fiber.on_done(Box::new(move |exit| {
                                if !latch.swap(true, Ordering::AcqRel) {
                                    resume(race_arm(winner, exit, loser, on_left));
                                }
                            }));
                        }
                        {
                            let winner = right_fiber.clone();
                            let loser = left_fiber;
                            right_fiber.on_done(Box::new(move |exit| {
                                if !latch.swap(true, Ordering::AcqRel) {
                                    resume(race_arm(winner, exit, loser, on_right));
                                }
                            }));
                        }
                        None
                    })
                };

                cur = Repr::Async {
                    register,
                    blocking_on,
                };
            }

            Repr::Suspend(make) => cur = make(&fiber.platform, fiber.id()),

            Repr::CaptureTrace(k) => {
                let trace = ExecutionTrace {
                    fiber_id: fiber.id(),
                    stack_depth: rs.stack.len(),
                    ancestry: collect_ancestry(&fiber),
                };
                cur = k(trace);
            }
        }
    }
}

/// Winner arm of a race: inherit the winner's fiber refs, then run the
/// user continuation with the winner's exit and the loser's handle.
fn race_arm(
    winner: Arc<Fiber>,
    exit: ExitRepr,
    loser: Arc<Fiber>,
    arm: crate::node::RaceCont,
) -> Repr {
    Repr::FlatMap(
        Box::new(Repr::InheritRefs(winner)),
        Box::new(move |_| arm(exit, loser)),
    )
}

/// Apply a stack-walk decision inside the turn loop.
fn advance(
    fiber: &Arc<Fiber>,
    mut rs: Box<RunState>,
    step: Step,
) -> Option<(Box<RunState>, Repr)> {
    match step {
        Step::Next(next) => Some((rs, next)),
        Step::Complete(exit) => {
            complete(fiber, rs, exit);
            None
        }
        Step::Shift(executor, next) => {
            rs.cur = Some(next);
            *fiber.run.lock() = Some(rs);
            submit_turn(fiber.clone(), executor);
            None
        }
    }
}

/// Feed a value through the continuation stack.
fn continue_with(fiber: &Arc<Fiber>, rs: &mut RunState, value: Value) -> Step {
    loop {
        match rs.stack.pop() {
            None => return Step::Complete(ExitRepr::Success(value)),
            Some(Frame::Apply(k)) => return Step::Next(k(value)),
            Some(Frame::Fold { success, .. }) => return Step::Next(success(value)),
            Some(Frame::InterruptRegionExit) => {
                rs.interrupt_mask.pop();
                // Pending interruption is delivered at region exit.
                if fiber.interrupt_pending() && rs.interruptible() {
                    return Step::Next(Repr::Fail(fiber.interrupt_cause()));
                }
            }
            Some(Frame::DaemonRegionExit) => {
                rs.daemon_mask.pop();
            }
            Some(Frame::EnvPop) => {
                rs.env.pop();
            }
            Some(Frame::ExecutorPop) => {
                rs.executors.pop();
                return Step::Shift(rs.executor(), Repr::Succeed(value));
            }
        }
    }
}

/// Unwind the stack with a cause, looking for a handler.
///
/// Sentinels perform their region maintenance but are never handlers.
/// `Fold` handlers are discarded while unmasked interruption is
/// pending, so interruption cannot be swallowed by `catch_all`.
fn unwind(fiber: &Arc<Fiber>, rs: &mut RunState, cause: DynCause) -> Step {
    loop {
        match rs.stack.pop() {
            None => {
                // Interruption that arrived during the failure is
                // merged so it is never silently lost. Identity
                // matters: the in-flight cause may already record one
                // interruptor while the accumulator gained another.
                let final_cause = if fiber.interrupt_pending() {
                    let accumulated = fiber.interrupt_cause();
                    if accumulated.interruptors().is_subset(&cause.interruptors()) {
                        cause
                    } else {
                        cause.then(accumulated)
                    }
                } else {
                    cause
                };
                return Step::Complete(ExitRepr::Failure(final_cause));
            }
            Some(Frame::Apply(_)) => {}
            Some(Frame::Fold { failure, .. }) => {
                if !(fiber.interrupt_pending() && rs.interruptible()) {
                    return Step::Next(failure(cause));
                }
            }
            Some(Frame::InterruptRegionExit) => {
                rs.interrupt_mask.pop();
            }
            Some(Frame::DaemonRegionExit) => {
                rs.daemon_mask.pop();
            }
            Some(Frame::EnvPop) => {
                rs.env.pop();
            }
            Some(Frame::ExecutorPop) => {
                rs.executors.pop();
                return Step::Shift(rs.executor(), Repr::Fail(cause));
            }
        }
    }
}

/// Complete the fiber: publish refs, flip the state machine, clean up
/// supervision, and notify observers (reverse of registration; the
/// order is unspecified for callers).
fn complete(fiber: &Arc<Fiber>, rs: Box<RunState>, exit: ExitRepr) {
    // Completion only happens once the stack walk drained every frame.
    debug_assert!(rs.stack.is_empty());
    fiber.publish_final_refs(rs.refs.clone());
    drop(rs);

    let Some(observers) = fiber.set_done(exit.clone()) else {
        return;
    };

    supervisor::on_fiber_done(fiber);

    if observers.is_empty() {
        if let ExitRepr::Failure(cause) = &exit {
            if cause.failed() || cause.died() {
                fiber.platform.report_failure_dyn(cause);
            }
        }
    }

    for observer in observers.into_iter().rev() {
        observer(exit.clone());
    }
}

/// The one-shot, epoch-guarded resume callback for an async round.
fn make_resume(fiber: &Arc<Fiber>, epoch: u64) -> ResumeFn {
    let fiber = fiber.clone();
    Arc::new(move |next: Repr| {
        if !fiber.try_resume(epoch) {
            // Stale epoch or double resume; discard.
            return;
        }
        let executor = {
            let mut run = fiber.run.lock();
            match run.as_mut() {
                Some(rs) => {
                    rs.cur = Some(next);
                    rs.executor()
                }
                None => return,
            }
        };
        submit_turn(fiber.clone(), executor);
    })
}

/// Run an infallible thunk, converting panics per the panic policy.
fn run_total(
    fiber: &Arc<Fiber>,
    thunk: Box<dyn FnOnce() -> Value + Send>,
) -> Result<Value, DynCause> {
    match catch_unwind(AssertUnwindSafe(move || thunk())) {
        Ok(value) => Ok(value),
        Err(payload) => Err(DynCause::die(classify_panic(fiber, payload))),
    }
}

/// Run a fallible thunk: `Err` becomes a typed failure, a panic
/// becomes a defect.
fn run_partial(
    fiber: &Arc<Fiber>,
    thunk: Box<dyn FnOnce() -> Result<Value, crate::node::ErrorValue> + Send>,
) -> Result<Value, DynCause> {
    match catch_unwind(AssertUnwindSafe(move || thunk())) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(DynCause::fail(error)),
        Err(payload) => Err(DynCause::die(classify_panic(fiber, payload))),
    }
}

/// Convert a panic payload to a defect; fatal defects are reported and
/// re-raised immediately.
fn classify_panic(fiber: &Arc<Fiber>, payload: Box<dyn std::any::Any + Send>) -> Defect {
    let defect = Defect::from_panic(payload);
    if fiber.platform.is_fatal(&defect) {
        fiber.platform.report_fatal(&defect);
        std::panic::resume_unwind(Box::new(defect));
    }
    defect
}

/// Supervising ancestors, nearest first.
fn collect_ancestry(fiber: &Arc<Fiber>) -> Vec<crate::fiber::FiberId> {
    let mut out = Vec::new();
    let mut current = fiber.parent.lock().clone();
    while let Some(weak) = current {
        match weak.upgrade() {
            Some(ancestor) => {
                out.push(ancestor.id());
                current = ancestor.parent.lock().clone();
            }
            None => break,
        }
    }
    out
}

/// Interrupt `target` (and its supervised descendants) as `by`, then
/// continue with the target's exit once it is done.
pub(crate) fn interrupt_node(target: Arc<Fiber>, by: crate::fiber::FiberId) -> Repr {
    Repr::FlatMap(
        Box::new(Repr::EffectTotal(Box::new({
            let target = target.clone();
            move || {
                supervisor::interrupt_tree(&target, by);
                boxed(())
            }
        }))),
        Box::new(move |_| await_node(target)),
    )
}

/// Suspend until `target` completes; continues with its exit.
pub(crate) fn await_node(target: Arc<Fiber>) -> Repr {
    let blocking_on = vec![target.id()];
    Repr::Async {
        register: Box::new(move |resume: ResumeFn| {
            target.on_done(Box::new(move |exit| {
                resume(Repr::Succeed(boxed(exit)));
            }));
            None
        }),
        blocking_on,
    }
}

// ============================================================================
// Tests
// ============================================================================
