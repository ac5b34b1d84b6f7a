//! # Effects
//!
//! An `Effect<A, E>` is an immutable description of a computation that
//! produces an `A`, fails with a typed `E` (or a defect, or an
//! interruption; see [`Cause`]), and may fork fibers, suspend on
//! callbacks, or read the environment. Nothing happens until a
//! [`Runtime`](crate::runtime::Runtime) runs it.
//!
//! Every combinator here reduces to the interpreter's closed node set;
//! the typed layer is a zero-cost discipline over the type-erased
//! tree. Values and errors must satisfy [`Data`]
//! (`Clone + Send + Sync + 'static`): cloning is what lets one exit be
//! observed by many fibers.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::environment::Environment;
use crate::executor::Executor;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberDescriptor, FiberId, FiberStatus};
use crate::interpreter;
use crate::node::{
    boxed, exit_to_repr, unbox, Data, DynCause, ErrorValue, ExecutionTrace, ExitRepr, Repr,
    ResumeFn,
};
use crate::platform::Platform;

/// Erase a typed cause for the interpreter.
pub(crate) fn erase_cause<E: Data>(cause: Cause<E>) -> DynCause {
    cause.map(&|e| boxed(e) as ErrorValue)
}

/// Recover a typed cause from the interpreter's channel.
pub(crate) fn reify_cause<E: Data>(cause: DynCause) -> Cause<E> {
    cause.map(&|e| unbox::<E>(e))
}

/// A description of a computation producing `A` or failing with `E`.
pub struct Effect<A, E = Infallible> {
    repr: Repr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_repr(repr: Repr) -> Self {
        Self {
            repr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_repr(self) -> Repr {
        self.repr
    }
}

impl<A, E> std::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect").field("node", &self.repr.tag()).finish()
    }
}

/// Typed resume callback handed to [`Effect::async_`] registrations.
///
/// Resuming is one-shot: the fiber's async epoch discards any call
/// after the first effective one, as well as resumes arriving after
/// the fiber was interrupted out of the suspension.
pub struct ResumeCallback<A, E = Infallible> {
    inner: ResumeFn,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for ResumeCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> ResumeCallback<A, E> {
    /// Resume the suspended fiber with an effect to continue as.
    pub fn resume(&self, effect: Effect<A, E>) {
        (self.inner)(effect.into_repr());
    }

    /// Resume with a pure value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::succeed(value));
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::fail(error));
    }

    /// Resume with a full cause.
    pub fn halt(&self, cause: Cause<E>) {
        self.resume(Effect::halt(cause));
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// A pure value.
    pub fn succeed(value: A) -> Self {
        Self::from_repr(Repr::Succeed(boxed(value)))
    }

    /// A suspended side effect that cannot fail in the typed channel.
    /// A panic in the thunk becomes a defect.
    pub fn total(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_repr(Repr::EffectTotal(Box::new(move || boxed(f()))))
    }

    /// A suspended side effect with a typed error channel. A panic in
    /// the thunk becomes a defect.
    pub fn attempt(f: impl FnOnce() -> Result<A, E> + Send + 'static) -> Self {
        Self::from_repr(Repr::EffectPartial(Box::new(move || match f() {
            Ok(value) => Ok(boxed(value)),
            Err(error) => Err(boxed(error) as ErrorValue),
        })))
    }

    /// Terminate with a typed error.
    pub fn fail(error: E) -> Self {
        Self::from_repr(Repr::Fail(DynCause::fail(boxed(error))))
    }

    /// Terminate with a full cause.
    pub fn halt(cause: Cause<E>) -> Self {
        Self::from_repr(Repr::Fail(erase_cause(cause)))
    }

    /// Terminate with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::from_repr(Repr::Fail(DynCause::die(defect)))
    }

    /// Replay a terminal exit.
    pub fn done(exit: Exit<A, E>) -> Self {
        Self::from_repr(exit_to_repr(exit.into_repr()))
    }

    /// Interrupt the current fiber as itself.
    pub fn interrupt() -> Self {
        Self::from_repr(Repr::Suspend(Box::new(|_, id| {
            Repr::Fail(DynCause::interrupt(id))
        })))
    }

    /// Suspend forever.
    pub fn never() -> Self {
        Self::from_repr(Repr::Async {
            register: Box::new(|_resume| None),
            blocking_on: Vec::new(),
        })
    }

    /// Suspend until the registration resumes the fiber.
    ///
    /// `register` receives the resume callback and may return an
    /// effect to continue with synchronously instead of suspending.
    pub fn async_(
        register: impl FnOnce(ResumeCallback<A, E>) -> Option<Effect<A, E>> + Send + 'static,
    ) -> Self {
        Self::async_blocking_on(register, Vec::new())
    }

    /// [`Effect::async_`], recording which fibers the suspension waits
    /// on (surfaced through the fiber descriptor).
    pub fn async_blocking_on(
        register: impl FnOnce(ResumeCallback<A, E>) -> Option<Effect<A, E>> + Send + 'static,
        blocking_on: Vec<FiberId>,
    ) -> Self {
        Self::from_repr(Repr::Async {
            register: Box::new(move |resume: ResumeFn| {
                let callback = ResumeCallback {
                    inner: resume,
                    _marker: PhantomData,
                };
                register(callback).map(Effect::into_repr)
            }),
            blocking_on,
        })
    }

    /// Defer effect construction until execution, with access to the
    /// platform and the running fiber's id.
    pub fn suspend_with(
        f: impl FnOnce(&Platform, FiberId) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::Suspend(Box::new(move |platform, id| {
            f(platform, id).into_repr()
        })))
    }

    /// Observe whether interruption is currently unmasked.
    pub fn check_interruptible(f: impl FnOnce(bool) -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_repr(Repr::CheckInterrupt(Box::new(move |flag| {
            f(flag).into_repr()
        })))
    }

    /// Observe whether forked children are currently daemons.
    pub fn check_daemon(f: impl FnOnce(bool) -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_repr(Repr::CheckDaemon(Box::new(move |flag| f(flag).into_repr())))
    }

    /// Read the environment record.
    pub fn access(f: impl FnOnce(Environment) -> A + Send + 'static) -> Self {
        Self::from_repr(Repr::Access(Box::new(move |env| {
            Repr::Succeed(boxed(f(env)))
        })))
    }

    /// Read the environment record and continue with an effect.
    pub fn access_effect(
        f: impl FnOnce(Environment) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::Access(Box::new(move |env| f(env).into_repr())))
    }
}

impl<E: Data> Effect<(), E> {
    /// The unit effect.
    pub fn unit() -> Self {
        Effect::succeed(())
    }

    /// Complete after `duration` on the platform timer.
    ///
    /// Interrupting a sleeping fiber lets the eventual firing go
    /// stale; no timer bookkeeping is required.
    pub fn sleep(duration: Duration) -> Self {
        Effect::suspend_with(move |platform, _| {
            let timer = platform.timer();
            Effect::async_(move |callback: ResumeCallback<(), E>| {
                timer.schedule(duration, move || callback.succeed(()));
                None
            })
        })
    }

    /// Cooperatively reschedule the current fiber.
    pub fn yield_now() -> Self {
        Effect::from_repr(Repr::YieldNow)
    }
}

impl<E: Data> Effect<Environment, E> {
    /// The current environment record.
    pub fn environment() -> Self {
        Effect::access(|env| env)
    }
}

impl<E: Data> Effect<FiberDescriptor, E> {
    /// This fiber's descriptor snapshot.
    pub fn descriptor() -> Self {
        Effect::from_repr(Repr::Descriptor(Box::new(|d| Repr::Succeed(boxed(d)))))
    }
}

impl<E: Data> Effect<ExecutionTrace, E> {
    /// Capture the current execution trace.
    pub fn trace() -> Self {
        Effect::from_repr(Repr::CaptureTrace(Box::new(|t| Repr::Succeed(boxed(t)))))
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// Transform the success value.
    pub fn map<B: Data>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::from_repr(Repr::FlatMap(
            Box::new(self.repr),
            Box::new(move |v| Repr::Succeed(boxed(f(unbox::<A>(v))))),
        ))
    }

    /// Replace the success value.
    pub fn as_value<B: Data>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value)
    }

    /// Transform the typed error channel.
    pub fn map_error<E2: Data>(self, f: impl Fn(E) -> E2 + Send + 'static) -> Effect<A, E2> {
        Effect::from_repr(Repr::Fold {
            inner: Box::new(self.repr),
            failure: Box::new(move |cause| {
                Repr::Fail(erase_cause(reify_cause::<E>(cause).map(&f)))
            }),
            success: Box::new(Repr::Succeed),
        })
    }

    /// Sequence: feed the value into the next effect.
    pub fn flat_map<B: Data>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_repr(Repr::FlatMap(
            Box::new(self.repr),
            Box::new(move |v| f(unbox::<A>(v)).into_repr()),
        ))
    }

    /// Sequence two effects, combining their values.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E> {
        self.flat_map(move |a| that.map(move |b| f(a, b)))
    }

    /// Sequence two effects, keeping both values.
    pub fn zip<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Sequence two effects, keeping the first value.
    pub fn zip_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.zip_with(that, |a, _| a)
    }

    /// Sequence two effects, keeping the second value.
    pub fn zip_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.zip_with(that, |_, b| b)
    }

    /// Handle both sides with plain functions.
    pub fn fold<B: Data, E2: Data>(
        self,
        on_error: impl FnOnce(E) -> B + Send + 'static,
        on_success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E2> {
        self.fold_effect(
            move |e| Effect::succeed(on_error(e)),
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Handle both sides with effects. Defects and interruptions pass
    /// through untouched.
    pub fn fold_effect<B: Data, E2: Data>(
        self,
        on_error: impl FnOnce(E) -> Effect<B, E2> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2> {
        Effect::from_repr(Repr::Fold {
            inner: Box::new(self.repr),
            failure: Box::new(move |cause| match reify_cause::<E>(cause).failure_or_cause() {
                Ok(error) => on_error(error).into_repr(),
                Err(other) => Repr::Fail(erase_cause(other)),
            }),
            success: Box::new(move |v| on_success(unbox::<A>(v)).into_repr()),
        })
    }

    /// Handle the full cause on failure.
    pub fn fold_cause<B: Data, E2: Data>(
        self,
        on_cause: impl FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2> {
        Effect::from_repr(Repr::Fold {
            inner: Box::new(self.repr),
            failure: Box::new(move |cause| on_cause(reify_cause::<E>(cause)).into_repr()),
            success: Box::new(move |v| on_success(unbox::<A>(v)).into_repr()),
        })
    }

    /// Recover from typed errors.
    pub fn catch_all<E2: Data>(
        self,
        handler: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_effect(handler, Effect::succeed)
    }

    /// Recover with access to the full cause, defects and
    /// interruptions included.
    pub fn catch_all_cause<E2: Data>(
        self,
        handler: impl FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause(handler, Effect::succeed)
    }

    /// Try another effect on typed failure.
    pub fn or_else<E2: Data>(
        self,
        that: impl FnOnce() -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.catch_all(move |_| that())
    }

    /// Reify the outcome as an exit, making the effect infallible.
    pub fn to_exit(self) -> Effect<Exit<A, E>, E> {
        self.fold_cause(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Success(value)),
        )
    }

    /// Run a finalizer on every exit: success, failure, or
    /// interruption. Finalizer failures compose into the cause rather
    /// than replacing it.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        let finalizer_repr = finalizer.into_repr();
        let captured = Repr::Fold {
            inner: Box::new(Repr::InterruptStatus(true, Box::new(self.repr))),
            failure: Box::new(|cause| Repr::Succeed(boxed(ExitRepr::Failure(cause)))),
            success: Box::new(|value| Repr::Succeed(boxed(ExitRepr::Success(value)))),
        };
        let sequenced = Repr::FlatMap(
            Box::new(captured),
            Box::new(move |exit_value| {
                let exit = unbox::<ExitRepr>(exit_value);
                run_finalizer_then(finalizer_repr, exit)
            }),
        );
        Effect::from_repr(Repr::InterruptStatus(false, Box::new(sequenced)))
    }

    /// Run a cleanup effect if this effect is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<(), Infallible>) -> Effect<A, E> {
        let cleanup_repr = cleanup.into_repr();
        let body = Repr::Fold {
            inner: Box::new(Repr::InterruptStatus(true, Box::new(self.repr))),
            failure: Box::new(move |cause| {
                if cause.interrupted() {
                    Repr::FlatMap(Box::new(cleanup_repr), Box::new(move |_| Repr::Fail(cause)))
                } else {
                    Repr::Fail(cause)
                }
            }),
            success: Box::new(Repr::Succeed),
        };
        Effect::from_repr(Repr::InterruptStatus(false, Box::new(body)))
    }

    /// Mask interruption for the whole effect.
    pub fn uninterruptible(self) -> Self {
        Self::from_repr(Repr::InterruptStatus(false, Box::new(self.repr)))
    }

    /// Unmask interruption for the whole effect.
    pub fn interruptible(self) -> Self {
        Self::from_repr(Repr::InterruptStatus(true, Box::new(self.repr)))
    }

    /// Fibers forked inside become daemons: globally tracked, not
    /// supervised by this fiber.
    pub fn daemon_children(self) -> Self {
        Self::from_repr(Repr::DaemonStatus(true, Box::new(self.repr)))
    }

    /// Fibers forked inside are supervised by this fiber.
    pub fn supervised_children(self) -> Self {
        Self::from_repr(Repr::DaemonStatus(false, Box::new(self.repr)))
    }

    /// Start the effect on a new fiber; continue with its handle.
    pub fn fork(self) -> Effect<FiberHandle<A, E>, E> {
        Effect::from_repr(Repr::FlatMap(
            Box::new(Repr::Fork(Box::new(self.repr))),
            Box::new(|v| Repr::Succeed(boxed(FiberHandle::<A, E>::new(unbox::<Arc<Fiber>>(v))))),
        ))
    }

    /// Fork as a daemon fiber, detached from this fiber's lifetime.
    pub fn fork_daemon(self) -> Effect<FiberHandle<A, E>, E> {
        self.fork().daemon_wrap()
    }

    /// Run the effect on the given executor, restoring the previous
    /// one afterwards.
    pub fn lock(self, executor: Arc<Executor>) -> Self {
        Self::from_repr(Repr::Lock(executor, Box::new(self.repr)))
    }

    /// Run the effect on the platform's blocking executor.
    pub fn on_blocking_executor(self) -> Self {
        Effect::suspend_with(move |platform, _| self.lock(platform.blocking_executor()))
    }

    /// Run the effect after a delay.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<(), E>::sleep(duration).flat_map(move |_| self)
    }

    /// Replace the environment for this effect.
    pub fn provide(self, environment: Environment) -> Self {
        Self::from_repr(Repr::Provide(environment, Box::new(self.repr)))
    }

    /// Extend the current environment with one service.
    pub fn provide_service<S: Data>(self, service: S) -> Self {
        Effect::access_effect(move |env| self.provide(env.add(service)))
    }

    /// Race two effects: the first to complete wins, the loser is
    /// interrupted, and the winner's exit is replayed.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        fn arm(exit: ExitRepr, loser: Arc<Fiber>) -> Repr {
            Repr::Suspend(Box::new(move |_, my_id| {
                Repr::FlatMap(
                    Box::new(interpreter::interrupt_node(loser, my_id)),
                    Box::new(move |_| exit_to_repr(exit)),
                )
            }))
        }

        Effect::from_repr(Repr::RaceWith {
            left: Box::new(self.repr),
            right: Box::new(that.repr),
            on_left: Box::new(arm),
            on_right: Box::new(arm),
        })
    }

    /// Race with explicit winner/loser continuations. The winner's
    /// fiber refs are inherited before the continuation runs.
    pub fn race_with<B: Data, C: Data, E2: Data>(
        self,
        that: Effect<B, E>,
        on_self: impl FnOnce(Exit<A, E>, FiberHandle<B, E>) -> Effect<C, E2> + Send + 'static,
        on_that: impl FnOnce(Exit<B, E>, FiberHandle<A, E>) -> Effect<C, E2> + Send + 'static,
    ) -> Effect<C, E2> {
        Effect::from_repr(Repr::RaceWith {
            left: Box::new(self.repr),
            right: Box::new(that.repr),
            on_left: Box::new(move |exit, loser| {
                on_self(Exit::from_repr(exit), FiberHandle::new(loser)).into_repr()
            }),
            on_right: Box::new(move |exit, loser| {
                on_that(Exit::from_repr(exit), FiberHandle::new(loser)).into_repr()
            }),
        })
    }

    /// Run both effects concurrently; fail fast, interrupting the
    /// other side, when either fails.
    pub fn zip_par<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.race_with(
            that,
            |exit_a, fiber_b| match exit_a {
                Exit::Success(a) => fiber_b.join().map(move |b| (a, b)),
                Exit::Failure(cause) => fiber_b
                    .interrupt()
                    .flat_map(move |_| Effect::halt(cause)),
            },
            |exit_b, fiber_a| match exit_b {
                Exit::Success(b) => fiber_a.join().map(move |a| (a, b)),
                Exit::Failure(cause) => fiber_a
                    .interrupt()
                    .flat_map(move |_| Effect::halt(cause)),
            },
        )
    }

    /// Complete with `None` if the effect takes longer than
    /// `duration`; the timed-out effect is interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race(Effect::<(), E>::sleep(duration).as_value(None))
    }

    /// Acquire a resource, use it, and release it on every exit path,
    /// interruption included. Acquisition and release are
    /// uninterruptible; use is interruptible.
    pub fn bracket<B: Data>(
        acquire: Effect<A, E>,
        release: impl FnOnce(A) -> Effect<(), Infallible> + Send + 'static,
        use_: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        let body = Repr::FlatMap(
            Box::new(acquire.repr),
            Box::new(move |resource_value| {
                let resource = unbox::<A>(resource_value);
                let for_release = resource.clone();
                let captured = Repr::Fold {
                    inner: Box::new(Repr::InterruptStatus(
                        true,
                        Box::new(use_(resource).into_repr()),
                    )),
                    failure: Box::new(|cause| Repr::Succeed(boxed(ExitRepr::Failure(cause)))),
                    success: Box::new(|value| Repr::Succeed(boxed(ExitRepr::Success(value)))),
                };
                Repr::FlatMap(
                    Box::new(captured),
                    Box::new(move |exit_value| {
                        let exit = unbox::<ExitRepr>(exit_value);
                        run_finalizer_then(release(for_release).into_repr(), exit)
                    }),
                )
            }),
        );
        Effect::from_repr(Repr::InterruptStatus(false, Box::new(body)))
    }

    /// Method form of [`Effect::bracket`] with `self` as the acquire
    /// step.
    pub fn acquire_release_with<B: Data>(
        self,
        release: impl FnOnce(A) -> Effect<(), Infallible> + Send + 'static,
        use_: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::bracket(self, release, use_)
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Look up a service of type `A` in the environment, dying if it
    /// is absent.
    pub fn service() -> Effect<A, E> {
        Effect::access_effect(|env| match env.get::<A>() {
            Some(service) => Effect::succeed(service),
            None => Effect::die(Defect::message(format!(
                "service not found in environment: {}",
                std::any::type_name::<A>()
            ))),
        })
    }
}

/// Run a finalizer, then replay `exit` with the finalizer's own
/// failure (if any) sequenced into the cause.
fn run_finalizer_then(finalizer: Repr, exit: ExitRepr) -> Repr {
    let finalizer_outcome = Repr::Fold {
        inner: Box::new(finalizer),
        failure: Box::new(|cause| Repr::Succeed(boxed(Some(cause)))),
        success: Box::new(|_| Repr::Succeed(boxed(None::<DynCause>))),
    };
    Repr::FlatMap(
        Box::new(finalizer_outcome),
        Box::new(move |outcome| {
            match (unbox::<Option<DynCause>>(outcome), exit) {
                (None, exit) => exit_to_repr(exit),
                (Some(fin_cause), ExitRepr::Failure(cause)) => Repr::Fail(cause.then(fin_cause)),
                (Some(fin_cause), ExitRepr::Success(_)) => Repr::Fail(fin_cause),
            }
        }),
    )
}

// ============================================================================
// Fiber handles
// ============================================================================

/// A typed handle to a running fiber.
pub struct FiberHandle<A, E = Infallible> {
    fiber: Arc<Fiber>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for FiberHandle<A, E> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for FiberHandle<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.fiber.id())
            .finish()
    }
}

impl<A: Data, E: Data> FiberHandle<A, E> {
    pub(crate) fn new(fiber: Arc<Fiber>) -> Self {
        Self {
            fiber,
            _marker: PhantomData,
        }
    }

    /// The fiber's identity.
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// The fiber's current lifecycle phase.
    pub fn status(&self) -> FiberStatus {
        self.fiber.status_view()
    }

    /// Suspend until the fiber completes; continue with its exit.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, E> {
        let target = self.fiber.clone();
        Effect::from_repr(Repr::FlatMap(
            Box::new(interpreter::await_node(target)),
            Box::new(|v| {
                Repr::Succeed(boxed(Exit::<A, E>::from_repr(unbox::<ExitRepr>(v))))
            }),
        ))
    }

    /// Await the fiber, inherit its fiber refs, and replay its exit
    /// into the current fiber.
    pub fn join(&self) -> Effect<A, E> {
        let target = self.fiber.clone();
        let inherit_target = self.fiber.clone();
        Effect::from_repr(Repr::FlatMap(
            Box::new(interpreter::await_node(target)),
            Box::new(move |v| {
                let exit = unbox::<ExitRepr>(v);
                Repr::FlatMap(
                    Box::new(Repr::InheritRefs(inherit_target)),
                    Box::new(move |_| exit_to_repr(exit)),
                )
            }),
        ))
    }

    /// Non-blocking completion check.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, E> {
        let target = self.fiber.clone();
        Effect::total(move || target.poll().map(Exit::from_repr))
    }

    /// Interrupt the fiber (and its supervised descendants) as the
    /// calling fiber, then await its exit.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, E> {
        let target = self.fiber.clone();
        Effect::from_repr(Repr::FlatMap(
            Box::new(Repr::Suspend(Box::new(move |_, my_id| {
                interpreter::interrupt_node(target, my_id)
            }))),
            Box::new(|v| {
                Repr::Succeed(boxed(Exit::<A, E>::from_repr(unbox::<ExitRepr>(v))))
            }),
        ))
    }

    /// Interrupt the fiber attributing the interruption to `by`.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, E> {
        let target = self.fiber.clone();
        Effect::from_repr(Repr::FlatMap(
            Box::new(interpreter::interrupt_node(target, by)),
            Box::new(|v| {
                Repr::Succeed(boxed(Exit::<A, E>::from_repr(unbox::<ExitRepr>(v))))
            }),
        ))
    }

    /// Merge the fiber's final fiber refs into the current fiber.
    pub fn inherit_refs(&self) -> Effect<(), E> {
        Effect::from_repr(Repr::InheritRefs(self.fiber.clone()))
    }
}

impl<A: Data, E: Data> Effect<FiberHandle<A, E>, E> {
    /// Wrap a fork in a daemon region so the child is unsupervised.
    fn daemon_wrap(self) -> Self {
        Self::from_repr(Repr::DaemonStatus(true, Box::new(self.into_repr())))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_reduce_to_expected_nodes() {
        assert_eq!(Effect::<i32>::succeed(1).repr.tag(), "Succeed");
        assert_eq!(Effect::<i32>::total(|| 1).repr.tag(), "EffectTotal");
        assert_eq!(
            Effect::<i32, String>::attempt(|| Ok(1)).repr.tag(),
            "EffectPartial"
        );
        assert_eq!(Effect::<i32, String>::fail("e".into()).repr.tag(), "Fail");
        assert_eq!(Effect::<(), Infallible>::yield_now().repr.tag(), "YieldNow");
        assert_eq!(Effect::<i32>::never().repr.tag(), "Async");
    }

    #[test]
    fn test_map_is_flat_map_of_succeed() {
        let eff = Effect::<i32>::succeed(1).map(|n| n + 1);
        assert_eq!(eff.repr.tag(), "FlatMap");
    }

    #[test]
    fn test_catch_all_is_fold() {
        let eff = Effect::<i32, String>::fail("e".into())
            .catch_all(|_| Effect::<i32, String>::succeed(0));
        assert_eq!(eff.repr.tag(), "Fold");
    }

    #[test]
    fn test_masking_wraps_in_interrupt_status() {
        let eff = Effect::<i32>::succeed(1).uninterruptible();
        assert_eq!(eff.repr.tag(), "InterruptStatus");
        let eff = Effect::<i32>::succeed(1).ensuring(Effect::unit());
        assert_eq!(eff.repr.tag(), "InterruptStatus");
    }

    #[test]
    fn test_race_reduces_to_race_with() {
        let eff = Effect::<i32>::succeed(1).race(Effect::succeed(2));
        assert_eq!(eff.repr.tag(), "RaceWith");
    }

    #[test]
    fn test_cause_erase_reify_roundtrip() {
        let cause: Cause<String> = Cause::fail("x".to_string()).then(Cause::interrupt(FiberId::new(1)));
        let back = reify_cause::<String>(erase_cause(cause.clone()));
        assert_eq!(back, cause);
    }
}
