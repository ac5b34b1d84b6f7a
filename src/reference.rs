//! Atomic References
//!
//! A `Ref` is a shared mutable cell whose operations are total,
//! linearizable effects. It carries no waiters: synchronization
//! between fibers happens through promises and queues, a `Ref` only
//! holds state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::node::Data;

/// Global ref ID counter, for diagnostics.
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// A shared, atomically updated cell.
pub struct Ref<A> {
    id: u64,
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<A> std::fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref").field("id", &self.id).finish()
    }
}

impl<A: Data> Ref<A> {
    fn allocate(value: A) -> Self {
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Allocate a ref holding `value`.
    pub fn make<E: Data>(value: A) -> Effect<Ref<A>, E> {
        Effect::total(move || Self::allocate(value))
    }

    /// Read the current value.
    pub fn get<E: Data>(&self) -> Effect<A, E> {
        let cell = self.cell.clone();
        Effect::total(move || cell.lock().clone())
    }

    /// Replace the value.
    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        let cell = self.cell.clone();
        Effect::total(move || {
            *cell.lock() = value;
        })
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set<E: Data>(&self, value: A) -> Effect<A, E> {
        self.modify(move |old| (old, value))
    }

    /// Apply a function to the value.
    pub fn update<E: Data>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<(), E> {
        self.modify(move |old| ((), f(old)))
    }

    /// Apply a function to the value, returning the new value.
    pub fn update_and_get<E: Data>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<A, E> {
        self.modify(move |old| {
            let new = f(old);
            (new.clone(), new)
        })
    }

    /// Apply a function to the value, returning the previous value.
    pub fn get_and_update<E: Data>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<A, E> {
        self.modify(move |old| (old.clone(), f(old)))
    }

    /// Atomically compute a result and a new value from the current
    /// value.
    pub fn modify<B: Data, E: Data>(
        &self,
        f: impl FnOnce(A) -> (B, A) + Send + 'static,
    ) -> Effect<B, E> {
        let cell = self.cell.clone();
        Effect::total(move || {
            let mut guard = cell.lock();
            let (result, new) = f(guard.clone());
            *guard = new;
            result
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refs_have_distinct_ids() {
        let a = Ref::allocate(1i32);
        let b = Ref::allocate(1i32);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_clone_shares_the_cell() {
        let a = Ref::allocate(1i32);
        let b = a.clone();
        *a.cell.lock() = 5;
        assert_eq!(*b.cell.lock(), 5);
    }
}
