//! Fiber-Local State
//!
//! A `FiberRef` is a per-fiber variable: each fiber sees its own
//! value, children receive a structurally-shared snapshot on fork, and
//! a joined child's value is merged back into the parent through the
//! ref's combine function.
//!
//! This is the runtime's carrier for request-scoped data: logging
//! context, trace identifiers, and anything else that should follow a
//! computation across forks and joins.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::Effect;
use crate::node::{boxed, unbox, Combine, Data, FiberRefToken, Repr, Value};

/// Global fiber-ref identity counter.
static NEXT_FIBER_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new token. Identity is the allocated id, never value or
/// pointer equality of the map entries.
pub(crate) fn new_token(initial: Value, combine: Combine) -> FiberRefToken {
    FiberRefToken {
        id: NEXT_FIBER_REF_ID.fetch_add(1, Ordering::Relaxed),
        initial,
        combine,
    }
}

/// A per-fiber variable with fork inheritance and join merging.
pub struct FiberRef<A> {
    token: FiberRefToken,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRef").field("id", &self.token.id).finish()
    }
}

impl<A: Data> FiberRef<A> {
    /// Allocate a fiber ref in the current fiber.
    ///
    /// `initial` is what fibers that never wrote the ref observe;
    /// `combine` merges a joined child's value into the parent's.
    pub fn make<E: Data>(
        initial: A,
        combine: impl Fn(A, A) -> A + Send + Sync + 'static,
    ) -> Effect<FiberRef<A>, E> {
        let erased: Combine = Arc::new(move |parent, child| {
            boxed(combine(unbox::<A>(parent), unbox::<A>(child)))
        });
        Effect::from_repr(Repr::FlatMap(
            Box::new(Repr::FiberRefMake {
                initial: boxed(initial),
                combine: erased,
            }),
            Box::new(|v| {
                Repr::Succeed(boxed(FiberRef::<A> {
                    token: unbox::<FiberRefToken>(v),
                    _marker: PhantomData,
                }))
            }),
        ))
    }

    /// A fiber ref whose join merge keeps the parent's value.
    pub fn make_parent_wins<E: Data>(initial: A) -> Effect<FiberRef<A>, E> {
        Self::make(initial, |parent, _| parent)
    }

    /// Read this fiber's value.
    pub fn get<E: Data>(&self) -> Effect<A, E> {
        self.modify(|value| (value.clone(), value))
    }

    /// Write this fiber's value.
    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        self.modify(move |_| ((), value))
    }

    /// Replace this fiber's value, returning the previous one.
    pub fn get_and_set<E: Data>(&self, value: A) -> Effect<A, E> {
        self.modify(move |old| (old, value))
    }

    /// Apply a function to this fiber's value.
    pub fn update<E: Data>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<(), E> {
        self.modify(move |old| ((), f(old)))
    }

    /// Atomically compute a result and a new value from this fiber's
    /// value.
    pub fn modify<B: Data, E: Data>(
        &self,
        f: impl FnOnce(A) -> (B, A) + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_repr(Repr::FiberRefModify {
            token: self.token.clone(),
            update: Box::new(move |old| {
                let (result, new) = f(unbox::<A>(old));
                (boxed(result), boxed(new))
            }),
        })
    }

    /// Run `effect` with this fiber's value set to `value`, restoring
    /// the previous value on every exit, interruption included.
    ///
    /// The read-and-override is the acquire step of a bracket, so the
    /// interruption mask is in place before the override is written
    /// and the restore step is guaranteed to run against it.
    pub fn locally<B: Data, E: Data>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        let override_ref = self.clone();
        let restore_ref = self.clone();
        Effect::bracket(
            self.get()
                .flat_map(move |previous| override_ref.set(value).as_value(previous)),
            move |previous| restore_ref.set(previous),
            move |_| effect,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ids_are_unique() {
        let combine: Combine = Arc::new(|parent, _| parent);
        let a = new_token(boxed(0i32), combine.clone());
        let b = new_token(boxed(0i32), combine);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_token_combine_is_applied() {
        let combine: Combine = Arc::new(|parent, child| {
            boxed(unbox::<i32>(parent) + unbox::<i32>(child))
        });
        let token = new_token(boxed(0i32), combine);
        let merged = (token.combine)(boxed(2i32), boxed(3i32));
        assert_eq!(unbox::<i32>(merged), 5);
    }
}
