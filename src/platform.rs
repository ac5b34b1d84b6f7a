//! Platform Services
//!
//! A `Platform` bundles the host-facing services a runtime needs: the
//! main executor, the blocking executor, the timer, panic
//! classification, and failure reporting. Runtimes share a platform;
//! every fiber carries a handle to the one it was launched under.
//!
//! The default platform is built lazily from
//! [`RuntimeConfig::from_env`] and shared process-wide.

use std::sync::{Arc, OnceLock};

use crate::cause::{Cause, Defect};
use crate::config::RuntimeConfig;
use crate::executor::Executor;
use crate::node::DynCause;
use crate::timer::Timer;

type FatalFn = Box<dyn Fn(&Defect) -> bool + Send + Sync>;
type ReportFatalFn = Box<dyn Fn(&Defect) + Send + Sync>;
type ReportFailureFn = Box<dyn Fn(&Cause<String>) + Send + Sync>;

/// Host services shared by every fiber of a runtime.
pub struct Platform {
    executor: Arc<Executor>,
    blocking_executor: Arc<Executor>,
    timer: Arc<Timer>,
    fatal: FatalFn,
    report_fatal: ReportFatalFn,
    report_failure: ReportFailureFn,
}

impl Platform {
    /// Build a platform from a configuration.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::builder().config(config.clone()).build()
    }

    /// Start building a platform.
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    /// The process-wide default platform, built on first use from the
    /// environment.
    pub fn default_arc() -> Arc<Platform> {
        static DEFAULT: OnceLock<Arc<Platform>> = OnceLock::new();
        DEFAULT
            .get_or_init(|| {
                let config = RuntimeConfig::from_env();
                config.apply_logging();
                Arc::new(Platform::new(&config))
            })
            .clone()
    }

    /// The main executor fiber turns run on.
    pub fn executor(&self) -> Arc<Executor> {
        self.executor.clone()
    }

    /// The unbounded executor for effects declared blocking.
    pub fn blocking_executor(&self) -> Arc<Executor> {
        self.blocking_executor.clone()
    }

    /// The delayed-task timer backing `sleep`.
    pub fn timer(&self) -> Arc<Timer> {
        self.timer.clone()
    }

    /// Whether a defect must bypass effect-level handling.
    pub fn is_fatal(&self, defect: &Defect) -> bool {
        (self.fatal)(defect)
    }

    /// Report a fatal defect. The interpreter re-raises afterwards.
    pub fn report_fatal(&self, defect: &Defect) {
        (self.report_fatal)(defect);
    }

    /// Report the failure of a fiber nobody observed.
    pub(crate) fn report_failure_dyn(&self, cause: &DynCause) {
        let described = cause.clone().map(&|e| describe_error(&e));
        (self.report_failure)(&described);
    }

    /// Stop the platform's executors and timer.
    ///
    /// Fibers still parked on them will never resume; call only when
    /// the runtime's work is done.
    pub fn shutdown(&self) {
        self.executor.shutdown();
        self.timer.shutdown();
    }

    /// A platform for unit tests, sharing the default platform's
    /// thread pools.
    #[cfg(test)]
    pub(crate) fn test() -> Platform {
        let base = Platform::default_arc();
        Platform {
            executor: base.executor(),
            blocking_executor: base.blocking_executor(),
            timer: base.timer(),
            fatal: Box::new(|_| false),
            report_fatal: Box::new(default_report_fatal),
            report_failure: Box::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("executor", &self.executor)
            .field("blocking_executor", &self.blocking_executor)
            .finish()
    }
}

/// Render a type-erased typed error for reporting.
fn describe_error(error: &crate::node::ErrorValue) -> String {
    if let Some(s) = error.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = error.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else {
        "<typed error>".to_string()
    }
}

fn default_report_fatal(defect: &Defect) {
    crate::error!("fatal defect, bypassing effect handlers: {}", defect);
}

fn default_report_failure(cause: &Cause<String>) {
    crate::log::LogBuilder::new(crate::log::LogLevel::Error)
        .message("fiber failed with an unobserved cause")
        .field("cause", cause.pretty_print().trim_end())
        .emit();
}

/// Builder for [`Platform`].
pub struct PlatformBuilder {
    config: RuntimeConfig,
    executor: Option<Arc<Executor>>,
    blocking_executor: Option<Arc<Executor>>,
    timer: Option<Arc<Timer>>,
    fatal: FatalFn,
    report_fatal: ReportFatalFn,
    report_failure: ReportFailureFn,
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            executor: None,
            blocking_executor: None,
            timer: None,
            fatal: Box::new(|_| false),
            report_fatal: Box::new(default_report_fatal),
            report_failure: Box::new(default_report_failure),
        }
    }
}

impl PlatformBuilder {
    /// Base configuration for executors built by this builder.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific main executor instead of building one.
    pub fn executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use a specific blocking executor instead of building one.
    pub fn blocking_executor(mut self, executor: Arc<Executor>) -> Self {
        self.blocking_executor = Some(executor);
        self
    }

    /// Use a specific timer instead of starting one.
    pub fn timer(mut self, timer: Arc<Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Classify defects that must bypass effect-level handling.
    pub fn fatal(mut self, f: impl Fn(&Defect) -> bool + Send + Sync + 'static) -> Self {
        self.fatal = Box::new(f);
        self
    }

    /// Hook invoked for fatal defects before they are re-raised.
    pub fn report_fatal(mut self, f: impl Fn(&Defect) + Send + Sync + 'static) -> Self {
        self.report_fatal = Box::new(f);
        self
    }

    /// Hook invoked when a fiber fails with nobody observing its exit.
    pub fn report_failure(mut self, f: impl Fn(&Cause<String>) + Send + Sync + 'static) -> Self {
        self.report_failure = Box::new(f);
        self
    }

    /// Build the platform, starting any executors not supplied.
    pub fn build(self) -> Platform {
        let executor = self.executor.unwrap_or_else(|| {
            Executor::pool(
                "fibra",
                self.config.scheduler.num_workers,
                self.config.scheduler.yield_op_count,
            )
        });
        let blocking_executor = self
            .blocking_executor
            .unwrap_or_else(|| Executor::blocking("fibra", self.config.blocking.keep_alive));
        let timer = self.timer.unwrap_or_else(|| Timer::new("fibra-timer"));

        Platform {
            executor,
            blocking_executor,
            timer,
            fatal: self.fatal,
            report_fatal: self.report_fatal,
            report_failure: self.report_failure,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_platform_is_shared() {
        let a = Platform::default_arc();
        let b = Platform::default_arc();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_fatal_classification() {
        let platform = Platform::builder()
            .executor(Platform::default_arc().executor())
            .blocking_executor(Platform::default_arc().blocking_executor())
            .timer(Platform::default_arc().timer())
            .fatal(|d| d.describe().contains("fatal"))
            .build();

        assert!(platform.is_fatal(&Defect::message("fatal: out of luck")));
        assert!(!platform.is_fatal(&Defect::message("ordinary")));
    }

    #[test]
    fn test_describe_error() {
        let s: crate::node::ErrorValue = Arc::new("plain".to_string());
        assert_eq!(describe_error(&s), "plain");

        let n: crate::node::ErrorValue = Arc::new(42i32);
        assert_eq!(describe_error(&n), "<typed error>");
    }
}
