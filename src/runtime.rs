//! Runtime Entry Points
//!
//! A `Runtime` pairs a [`Platform`] with an [`Environment`] and turns
//! effect descriptions into running fibers. `run` blocks the calling
//! OS thread until the root fiber completes; `run_async` registers a
//! callback instead; `spawn` hands back the fiber.

use std::sync::Arc;

use crate::effect::{Effect, FiberHandle};
use crate::environment::Environment;
use crate::exit::Exit;
use crate::interpreter;
use crate::node::Data;
use crate::platform::Platform;

/// Executes effects on fibers.
#[derive(Debug, Clone)]
pub struct Runtime {
    platform: Arc<Platform>,
    environment: Environment,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime on the shared default platform with an empty
    /// environment.
    pub fn new() -> Self {
        Self {
            platform: Platform::default_arc(),
            environment: Environment::empty(),
        }
    }

    /// A runtime on a specific platform.
    pub fn with_platform(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            environment: Environment::empty(),
        }
    }

    /// Replace the base environment provided to root fibers.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// The platform this runtime launches fibers under.
    pub fn platform(&self) -> Arc<Platform> {
        self.platform.clone()
    }

    /// Run an effect to completion, blocking the calling OS thread.
    pub fn run<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let fiber = interpreter::spawn_root(
            self.platform.clone(),
            self.environment.clone(),
            effect.into_repr(),
        );
        let (tx, rx) = crossbeam_channel::bounded(1);
        fiber.on_done(Box::new(move |exit| {
            let _ = tx.send(exit);
        }));
        let exit = rx
            .recv()
            .expect("root fiber completed without publishing an exit");
        Exit::from_repr(exit)
    }

    /// Run an effect without blocking; `k` receives the exit.
    pub fn run_async<A: Data, E: Data>(
        &self,
        effect: Effect<A, E>,
        k: impl FnOnce(Exit<A, E>) + Send + 'static,
    ) {
        let fiber = interpreter::spawn_root(
            self.platform.clone(),
            self.environment.clone(),
            effect.into_repr(),
        );
        fiber.on_done(Box::new(move |exit| k(Exit::from_repr(exit))));
    }

    /// Start an effect on a root fiber and hand back its handle.
    pub fn spawn<A: Data, E: Data>(&self, effect: Effect<A, E>) -> FiberHandle<A, E> {
        let fiber = interpreter::spawn_root(
            self.platform.clone(),
            self.environment.clone(),
            effect.into_repr(),
        );
        FiberHandle::new(fiber)
    }
}

// ============================================================================
// Tests
// ============================================================================
