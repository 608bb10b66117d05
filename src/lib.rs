//! Application bootstrap runtime for long-lived services.
//!
//! An [`App`] loads configuration, brings up logging and metrics, builds a
//! lazily resolved service container, runs the entry point and turns however
//! the run ended into a process exit code.

pub mod config;
pub mod container;
pub mod http;
pub mod ids;
pub mod lifecycle;
pub mod observability;

/// Error type returned by entry points and service factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{AppConfig, BaseConfig, ConfigSource};
pub use container::{ContainerError, ServiceContainer, ServiceDefinitions};
pub use lifecycle::{
    App, AppBuilder, CancelReason, CancellationToken, ExitCode, LifecycleState, RunContext,
    RunError, RunOutcome, TerminationCause,
};
pub use observability::{Logger, Metrics};
