//! # Composable Failure Causes
//!
//! A `Cause` is the full story of why a fiber failed: a typed,
//! domain-level error, a defect (an unexpected panic), an interruption
//! by another fiber, or a sequential/parallel combination of those.
//!
//! ## Design
//!
//! - `then` records failures that happened one after another (for
//!   example a use-site failure followed by a finalizer failure).
//! - `both` records failures that happened concurrently.
//! - `Empty` is a two-sided identity of both combinators, and each
//!   combinator associates; `contains` and the predicates treat causes
//!   modulo those identities.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

/// An unexpected failure: the payload of a panic that escaped a user
/// thunk, or an explicit `die`.
///
/// Defects are type-erased and shareable. Two defects compare equal
/// only when they share the same underlying payload allocation.
#[derive(Clone)]
pub struct Defect(Arc<dyn Any + Send + Sync>);

impl Defect {
    /// Create a defect from an arbitrary payload.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Create a defect carrying a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self(Arc::new(msg.into()))
    }

    /// Convert a captured panic payload into a defect.
    ///
    /// String payloads (the common case for `panic!`) keep their
    /// message; any other payload becomes an opaque defect.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            return Self::message(*s);
        }
        match payload.downcast::<String>() {
            Ok(s) => Self(Arc::new(*s)),
            Err(_) => Self::message("panic with non-string payload"),
        }
    }

    /// Attempt to view the payload as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Best-effort human-readable description of the payload.
    pub fn describe(&self) -> String {
        if let Some(s) = self.0.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else {
            "<opaque defect>".to_string()
        }
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.describe())
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// The cause of a fiber failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure. Identity of `then` and `both`.
    Empty,
    /// A typed, expected error.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// Two causes in sequence.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Two causes in parallel.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// Cause of a typed error.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// Cause of a defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// Cause of an interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition. `Empty` is an identity on both sides.
    pub fn then(self, that: Cause<E>) -> Self {
        match (self, that) {
            (Cause::Empty, c) => c,
            (c, Cause::Empty) => c,
            (a, b) => Cause::Then(Box::new(a), Box::new(b)),
        }
    }

    /// Parallel composition. `Empty` is an identity on both sides.
    pub fn both(self, that: Cause<E>) -> Self {
        match (self, that) {
            (Cause::Empty, c) => c,
            (c, Cause::Empty) => c,
            (a, b) => Cause::Both(Box::new(a), Box::new(b)),
        }
    }

    /// True when the cause contains no failure at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Then(a, b) | Cause::Both(a, b) => a.is_empty() && b.is_empty(),
            _ => false,
        }
    }

    /// True when the cause contains at least one typed error.
    pub fn failed(&self) -> bool {
        match self {
            Cause::Fail(_) => true,
            Cause::Then(a, b) | Cause::Both(a, b) => a.failed() || b.failed(),
            _ => false,
        }
    }

    /// True when the cause contains at least one defect.
    pub fn died(&self) -> bool {
        match self {
            Cause::Die(_) => true,
            Cause::Then(a, b) | Cause::Both(a, b) => a.died() || b.died(),
            _ => false,
        }
    }

    /// True when the cause contains at least one interruption.
    pub fn interrupted(&self) -> bool {
        match self {
            Cause::Interrupt(_) => true,
            Cause::Then(a, b) | Cause::Both(a, b) => a.interrupted() || b.interrupted(),
            _ => false,
        }
    }

    /// The set of fibers that interrupted this fiber.
    pub fn interruptors(&self) -> HashSet<FiberId> {
        let mut out = HashSet::new();
        self.collect_interruptors(&mut out);
        out
    }

    fn collect_interruptors(&self, out: &mut HashSet<FiberId>) {
        match self {
            Cause::Interrupt(id) => {
                out.insert(*id);
            }
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.collect_interruptors(out);
                b.collect_interruptors(out);
            }
            _ => {}
        }
    }

    /// All typed errors in the cause, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.collect_failures(&mut out);
        out
    }

    fn collect_failures<'a>(&'a self, out: &mut Vec<&'a E>) {
        match self {
            Cause::Fail(e) => out.push(e),
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.collect_failures(out);
                b.collect_failures(out);
            }
            _ => {}
        }
    }

    /// The defects in the cause, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.collect_defects(&mut out);
        out
    }

    fn collect_defects<'a>(&'a self, out: &mut Vec<&'a Defect>) {
        match self {
            Cause::Die(d) => out.push(d),
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.collect_defects(out);
                b.collect_defects(out);
            }
            _ => {}
        }
    }

    /// Drop `Empty` leaves from combinator nodes.
    ///
    /// The result is structurally canonical enough for `contains` to
    /// compare causes modulo the identity laws.
    pub fn normalize(self) -> Self {
        match self {
            Cause::Then(a, b) => a.normalize().then(b.normalize()),
            Cause::Both(a, b) => a.normalize().both(b.normalize()),
            other => other,
        }
    }

    /// Transform the typed error channel.
    pub fn map<E2>(self, f: &impl Fn(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(a, b) => Cause::Then(Box::new(a.map(f)), Box::new(b.map(f))),
            Cause::Both(a, b) => Cause::Both(Box::new(a.map(f)), Box::new(b.map(f))),
        }
    }

    /// Render an indented tree of the cause.
    pub fn pretty_print(&self) -> String
    where
        E: fmt::Debug,
    {
        let mut out = String::new();
        self.render(0, &mut out);
        out
    }

    fn render(&self, depth: usize, out: &mut String)
    where
        E: fmt::Debug,
    {
        let pad = "  ".repeat(depth);
        match self {
            Cause::Empty => out.push_str(&format!("{pad}Empty\n")),
            Cause::Fail(e) => out.push_str(&format!("{pad}Fail: {e:?}\n")),
            Cause::Die(d) => out.push_str(&format!("{pad}Die: {d}\n")),
            Cause::Interrupt(id) => out.push_str(&format!("{pad}Interrupted by {id}\n")),
            Cause::Then(a, b) => {
                out.push_str(&format!("{pad}Then\n"));
                a.render(depth + 1, out);
                b.render(depth + 1, out);
            }
            Cause::Both(a, b) => {
                out.push_str(&format!("{pad}Both\n"));
                a.render(depth + 1, out);
                b.render(depth + 1, out);
            }
        }
    }
}

impl<E: Clone> Cause<E> {
    /// Split off the first typed error, or return the cause untouched
    /// when it carries no typed error.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self.failures().first() {
            Some(e) => Ok((*e).clone()),
            None => Err(self),
        }
    }
}

impl<E: PartialEq + Clone> Cause<E> {
    /// Structural containment, modulo the `Empty` identities.
    pub fn contains(&self, that: &Cause<E>) -> bool {
        let this = self.clone().normalize();
        let that = that.clone().normalize();
        this.contains_normalized(&that)
    }

    fn contains_normalized(&self, that: &Cause<E>) -> bool {
        if self == that {
            return true;
        }
        match self {
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.contains_normalized(that) || b.contains_normalized(that)
            }
            _ => false,
        }
    }
}

impl<E> Cause<Option<E>> {
    /// Lift the optional error domain out of the cause.
    ///
    /// Returns `None` exactly when the cause reduces to `Fail(None)`
    /// leaves only; combinator nodes keep whichever side survives.
    pub fn sequence_option(self) -> Option<Cause<E>> {
        match self {
            Cause::Empty => Some(Cause::Empty),
            Cause::Fail(Some(e)) => Some(Cause::Fail(e)),
            Cause::Fail(None) => None,
            Cause::Die(d) => Some(Cause::Die(d)),
            Cause::Interrupt(id) => Some(Cause::Interrupt(id)),
            Cause::Then(a, b) => match (a.sequence_option(), b.sequence_option()) {
                (Some(a), Some(b)) => Some(Cause::Then(Box::new(a), Box::new(b))),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            },
            Cause::Both(a, b) => match (a.sequence_option(), b.sequence_option()) {
                (Some(a), Some(b)) => Some(Cause::Both(Box::new(a), Box::new(b))),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
