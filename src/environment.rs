//! Environment Record
//!
//! An `Environment` is an immutable, type-indexed record of services
//! threaded through effects by `Access`/`Provide`. One record can hold
//! any number of services, keyed by their type; the [`Has`] trait is
//! the typed accessor over it.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::node::{boxed, unbox, Data, Value};

/// A type-indexed service record.
///
/// Adding a service with the same type replaces the previous one.
/// Cloning is cheap: services are stored behind shared pointers.
#[derive(Clone, Default)]
pub struct Environment {
    services: HashMap<TypeId, Value>,
}

impl Environment {
    /// The empty record.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Extend the record with a service, keyed by its type.
    pub fn add<S: Data>(mut self, service: S) -> Self {
        self.services.insert(TypeId::of::<S>(), boxed(service));
        self
    }

    /// Look up a service by type.
    pub fn get<S: Data>(&self) -> Option<S> {
        self.services
            .get(&TypeId::of::<S>())
            .map(|v| unbox::<S>(v.clone()))
    }

    /// Whether the record holds a service of this type.
    pub fn contains<S: Data>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Number of services in the record.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the record is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("services", &self.services.len())
            .finish()
    }
}

/// Typed access to one service of an environment record.
pub trait Has<S: Data> {
    /// The service, if present.
    fn service(&self) -> Option<S>;
}

impl<S: Data> Has<S> for Environment {
    fn service(&self) -> Option<S> {
        self.get::<S>()
    }
}

// ============================================================================
// Tests
// ============================================================================
