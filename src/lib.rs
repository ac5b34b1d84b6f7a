//! # Fibra
//!
//! Structured, effect-based concurrent programming on a fiber runtime.
//!
//! An [`Effect`] is an immutable description of a computation; a
//! [`Runtime`] interprets it on lightweight, interruptible,
//! cooperatively scheduled fibers. Failures are first-class values
//! ([`Cause`], [`Exit`]), cancellation is structured, and resources
//! acquired with `bracket` are released on every exit path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          FIBRA                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────────┐      │
//! │  │   Effect   │──▶│ Interpreter  │──▶│  Fiber state  │      │
//! │  │ (effect.rs)│   │(interpreter) │   │  (fiber.rs)   │      │
//! │  └────────────┘   └──────────────┘   └───────────────┘      │
//! │        │                 │                   │               │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────────┐      │
//! │  │ Promise /  │   │  Executor /  │   │  Supervisor   │      │
//! │  │ Queue / Ref│   │    Timer     │   │ (supervision) │      │
//! │  └────────────┘   └──────────────┘   └───────────────┘      │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use fibra::{Effect, Runtime};
//! use std::time::Duration;
//!
//! let runtime = Runtime::new();
//! let program = Effect::<i32, String>::succeed(20)
//!     .map(|n| n * 2)
//!     .timeout(Duration::from_secs(1));
//! let exit = runtime.run(program);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod effect;
pub mod environment;
pub mod executor;
pub mod exit;
mod fiber;
pub mod fiber_local;
mod interpreter;
pub mod log;
mod node;
pub mod platform;
pub mod promise;
pub mod queue;
pub mod reference;
pub mod runtime;
mod stack;
mod supervisor;
pub mod timer;

// Re-exports
pub use cause::{Cause, Defect};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{Effect, FiberHandle, ResumeCallback};
pub use environment::{Environment, Has};
pub use executor::Executor;
pub use exit::Exit;
pub use fiber::{FiberDescriptor, FiberId, FiberStatus};
pub use fiber_local::FiberRef;
pub use log::{LogFormat, LogLevel};
pub use node::{Data, ExecutionTrace};
pub use platform::{Platform, PlatformBuilder};
pub use promise::Promise;
pub use queue::Queue;
pub use reference::Ref;
pub use runtime::Runtime;
pub use supervisor::daemon_count;
pub use timer::{Timer, TimerKey};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A runtime on the shared default platform.
pub fn init() -> Runtime {
    Runtime::new()
}

/// A runtime on a fresh platform built from the given configuration.
///
/// The configuration's logging settings are applied globally.
pub fn init_with_config(config: RuntimeConfig) -> Runtime {
    config.apply_logging();
    Runtime::with_platform(std::sync::Arc::new(Platform::new(&config)))
}

/// A runtime configured from `FIBRA_*` environment variables.
pub fn init_from_env() -> Runtime {
    init_with_config(RuntimeConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_runs_effects() {
        let runtime = init();
        let exit = runtime.run(Effect::<&str>::succeed("up"));
        assert_eq!(exit, Exit::Success("up"));
    }

    #[test]
    fn test_init_with_config() {
        let config = RuntimeConfig::builder()
            .num_workers(2)
            .yield_op_count(256)
            .build()
            .unwrap();
        let runtime = init_with_config(config);
        let exit = runtime.run(Effect::<i32>::total(|| 1 + 1));
        assert_eq!(exit, Exit::Success(2));
    }
}
