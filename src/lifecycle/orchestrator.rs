//! The application state machine.
//!
//! ```text
//! Init → ConfigLoading → Configured → Running → Terminating → Done
//!              │              │
//!              └──────────────┴──▶ Terminating (config or startup failure)
//! ```
//!
//! One [`App`] runs once. The run loop polls the entry point and the host
//! event channel together; a fault ends the run without waiting for the
//! entry point, a signal only cancels the run token.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::loader::ConfigSource;
use crate::config::schema::{AppConfig, BaseConfig, LogLevel};
use crate::config::watcher::ConfigWatcher;
use crate::container::{Builtins, ServiceContainer, ServiceDefinitions};
use crate::http::server::MetricsServer;
use crate::ids::IdGenerator;
use crate::lifecycle::cancellation::{CancelReason, CancellationToken};
use crate::lifecycle::chain::CancellationChain;
use crate::lifecycle::exit::{classify, ExitCode, Observation, TerminationCause};
use crate::lifecycle::shutdown::RunResources;
use crate::lifecycle::signals::{Fault, HostEnvironment, HostError, HostEvent, OsHost, Signal};
use crate::lifecycle::startup;
use crate::observability::logging::{init_logging, Logger};
use crate::observability::metrics::{Metrics, MetricsRegistry};
use crate::BoxError;

const EXTERNAL_SOURCE: &str = "external";
const APP_SOURCE: &str = "app";

/// Where an [`App`] is in its single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Init = 0,
    ConfigLoading = 1,
    Configured = 2,
    Running = 3,
    Terminating = 4,
    Done = 5,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Init,
            1 => LifecycleState::ConfigLoading,
            2 => LifecycleState::Configured,
            3 => LifecycleState::Running,
            4 => LifecycleState::Terminating,
            _ => LifecycleState::Done,
        }
    }
}

/// Errors that prevent a run from producing an outcome.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("app has already been run")]
    AlreadyRun,

    #[error("failed to install host traps: {0}")]
    Host(#[from] HostError),
}

/// What the entry point receives.
pub struct RunContext<C> {
    pub config: Arc<C>,
    pub logger: Logger,
    pub metrics: Metrics,
    pub container: Arc<ServiceContainer>,
    /// The run token; the entry point should return soon after it fires.
    pub cancellation: CancellationToken,
    /// The app's own controller; cancelling it aborts the run (exit 4).
    pub abort: CancellationToken,
    pub run_id: String,
    pub name: String,
    pub version: String,
    /// Bound address of the metrics listener, if one was started.
    pub metrics_address: Option<SocketAddr>,
}

impl<C> Clone for RunContext<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            logger: self.logger.clone(),
            metrics: self.metrics.clone(),
            container: self.container.clone(),
            cancellation: self.cancellation.clone(),
            abort: self.abort.clone(),
            run_id: self.run_id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            metrics_address: self.metrics_address,
        }
    }
}

impl<C> fmt::Debug for RunContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("run_id", &self.run_id)
            .field("metrics_address", &self.metrics_address)
            .finish()
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: ExitCode,
    /// `None` when the caller's token was already cancelled and nothing ran.
    pub cause: Option<TerminationCause>,
    pub run_id: String,
}

type EntryPoint<C> =
    Arc<dyn Fn(RunContext<C>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Builder for [`App`].
pub struct AppBuilder<C> {
    name: String,
    version: String,
    config_source: ConfigSource,
    watch_config: bool,
    definitions: ServiceDefinitions,
    entry_point: Option<EntryPoint<C>>,
    host: Arc<dyn HostEnvironment>,
}

impl<C: AppConfig> AppBuilder<C> {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn config_source(mut self, source: ConfigSource) -> Self {
        self.config_source = source;
        self
    }

    /// Reload the config file on change and apply `log.level` live.
    pub fn watch_config(mut self, enabled: bool) -> Self {
        self.watch_config = enabled;
        self
    }

    /// Register a lazily built service.
    pub fn service<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceContainer) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.definitions.register(name, factory);
        self
    }

    /// Replace the registered services with `definitions`.
    pub fn services(mut self, definitions: ServiceDefinitions) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn entry_point<F, Fut>(mut self, entry_point: F) -> Self
    where
        F: Fn(RunContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.entry_point = Some(Arc::new(move |ctx| entry_point(ctx).boxed()));
        self
    }

    /// Use `host` for signal and fault traps instead of the process.
    pub fn host<H: HostEnvironment + 'static>(mut self, host: H) -> Self {
        self.host = Arc::new(host);
        self
    }

    pub fn build(self) -> App<C> {
        App {
            name: self.name,
            version: self.version,
            config_source: self.config_source,
            watch_config: self.watch_config,
            definitions: self.definitions,
            entry_point: self.entry_point,
            host: self.host,
            abort_controller: CancellationToken::new(),
            state: AtomicU8::new(LifecycleState::Init as u8),
        }
    }
}

/// A long-lived service process, run once.
pub struct App<C: AppConfig = BaseConfig> {
    name: String,
    version: String,
    config_source: ConfigSource,
    watch_config: bool,
    definitions: ServiceDefinitions,
    entry_point: Option<EntryPoint<C>>,
    host: Arc<dyn HostEnvironment>,
    abort_controller: CancellationToken,
    state: AtomicU8,
}

/// How the run loop ended.
enum Ended {
    Returned(Option<BoxError>),
    Fault(Fault),
}

impl<C: AppConfig> App<C> {
    pub fn builder(name: impl Into<String>) -> AppBuilder<C> {
        AppBuilder {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_source: ConfigSource::default(),
            watch_config: false,
            definitions: ServiceDefinitions::new(),
            entry_point: None,
            host: Arc::new(OsHost),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The app's own cancellation source, also exposed to services as
    /// `abort_controller`.
    pub fn abort_controller(&self) -> &CancellationToken {
        &self.abort_controller
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run the app once. `external` lets the caller cancel the run (exit 5).
    pub async fn run(&self, external: Option<CancellationToken>) -> Result<RunOutcome, RunError> {
        if self
            .state
            .compare_exchange(
                LifecycleState::Init as u8,
                LifecycleState::ConfigLoading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(RunError::AlreadyRun);
        }

        let run_id = IdGenerator::new().generate();

        if external.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.set_state(LifecycleState::Done);
            return Ok(RunOutcome {
                exit_code: ExitCode::Success,
                cause: None,
                run_id,
            });
        }

        init_logging();
        let logger = Logger::for_run(&self.name, &self.version, &run_id);
        let span = logger.span().clone();
        let result = self.run_inner(external, run_id, logger).instrument(span).await;
        self.set_state(LifecycleState::Done);
        result
    }

    /// [`run`](Self::run) without a caller token, mapped to a process exit
    /// code.
    pub async fn run_to_exit(&self) -> std::process::ExitCode {
        match self.run(None).await {
            Ok(outcome) => outcome.exit_code.into(),
            Err(error) => {
                tracing::error!(error = %error, "Run failed to start");
                ExitCode::Unexpected.into()
            }
        }
    }

    async fn run_inner(
        &self,
        external: Option<CancellationToken>,
        run_id: String,
        logger: Logger,
    ) -> Result<RunOutcome, RunError> {
        let mut chain = CancellationChain::new();
        if let Some(external) = &external {
            chain.link(EXTERNAL_SOURCE, external);
        }
        chain.link(APP_SOURCE, &self.abort_controller);
        let internal = chain.token().clone();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let traps = match self.host.install(events_tx) {
            Ok(traps) => traps,
            Err(error) => {
                logger.log(
                    LogLevel::Fatal,
                    "failed to install host traps",
                    Some(&json!({ "error": error.to_string() })),
                );
                chain.detach_all();
                logger.wait_for_idle().await;
                return Err(error.into());
            }
        };
        let mut resources = RunResources::new(chain, traps, events_rx);

        logger.info("starting");
        let driven = AssertUnwindSafe(self.drive(
            &mut resources,
            external.as_ref(),
            &internal,
            &run_id,
            &logger,
        ))
        .catch_unwind()
        .await;
        let cause = match driven {
            Ok(cause) => cause,
            Err(payload) => {
                let fault = Fault::from_panic_payload(payload.as_ref());
                resources.ledger.record(&fault);
                unrecovered(fault, &internal, &logger)
            }
        };
        self.set_state(LifecycleState::Terminating);

        let exit_code = cause.exit_code();
        logger.log(
            if exit_code.is_success() { LogLevel::Info } else { LogLevel::Warning },
            "run finished",
            Some(&json!({ "exit_code": exit_code.code(), "cause": cause.to_string() })),
        );
        resources.teardown(&logger).await;

        Ok(RunOutcome {
            exit_code,
            cause: Some(cause),
            run_id,
        })
    }

    /// Bring the run up, run the entry point and pick the termination cause.
    async fn drive(
        &self,
        resources: &mut RunResources,
        external: Option<&CancellationToken>,
        internal: &CancellationToken,
        run_id: &str,
        logger: &Logger,
    ) -> TerminationCause {
        let loaded = match startup::acquire_config::<C>(&self.name, &self.config_source, logger) {
            Ok(loaded) => loaded,
            Err(error) => {
                return fault_or(resources, internal, logger, TerminationCause::ConfigLoad(error))
            }
        };
        let path = loaded.path.clone();
        let watcher = Arc::new(ConfigWatcher::new(loaded));
        let config = watcher.current();
        let base = config.base().clone();
        startup::apply_log_config(&base.log, logger);
        if self.watch_config {
            resources.config_watcher = startup::start_watcher(
                &watcher,
                &self.name,
                &self.config_source,
                path.as_deref(),
                logger,
            );
        }
        self.set_state(LifecycleState::Configured);

        let registry = match MetricsRegistry::new(&base.metrics.histogram_buckets) {
            Ok(registry) => registry,
            Err(error) => return startup_failure(resources, internal, logger, error.into()),
        };
        let metrics = Metrics::new(Arc::new(registry));

        let builtins = Builtins::new(
            config.clone(),
            watcher,
            logger.clone(),
            metrics.clone(),
            self.name.clone(),
            self.version.clone(),
            internal.clone(),
            self.abort_controller.clone(),
        );
        let container = match ServiceContainer::new(builtins, self.definitions.clone()) {
            Ok(container) => container,
            Err(error) => return startup_failure(resources, internal, logger, error.into()),
        };

        let mut metrics_address = None;
        if !base.dry_run {
            let server = MetricsServer::new(metrics.clone(), container.id_generator());
            match server.start(&base.metrics.bind_address, internal.clone()).await {
                Ok(addr) => metrics_address = Some(addr),
                Err(error) => {
                    return startup_failure(resources, internal, logger, error.into())
                }
            }
            resources.metrics_server = Some(server);
        }

        self.set_state(LifecycleState::Running);

        let body: BoxFuture<'static, Result<(), BoxError>> = match (&self.entry_point, base.dry_run) {
            (_, true) => {
                logger.info("run skipped (dry run)");
                futures_util::future::ready(Ok(())).boxed()
            }
            (None, false) => {
                logger.warning("no entry point configured");
                futures_util::future::ready(Ok(())).boxed()
            }
            (Some(entry_point), false) => entry_point(RunContext {
                config,
                logger: logger.child("main"),
                metrics,
                container,
                cancellation: internal.clone(),
                abort: self.abort_controller.clone(),
                run_id: run_id.to_string(),
                name: self.name.clone(),
                version: self.version.clone(),
                metrics_address,
            }),
        };

        let ended = run_loop(body, resources, internal, logger).await;

        match ended {
            Ended::Fault(fault) => unrecovered(fault, internal, logger),
            Ended::Returned(entry_error) => {
                let observation = Observation {
                    internal: internal.reason(),
                    external: external.and_then(CancellationToken::reason),
                    app: self.abort_controller.reason(),
                    signal: resources.signal,
                    entry_error,
                };
                report_entry_error(&observation, logger);
                classify(observation)
            }
        }
    }
}

fn unrecovered(fault: Fault, internal: &CancellationToken, logger: &Logger) -> TerminationCause {
    logger.log(
        LogLevel::Fatal,
        "unrecovered fault",
        Some(&json!({ "fault": fault.to_string() })),
    );
    internal.cancel_with(CancelReason::new(format!("unrecovered fault: {}", fault.message())));
    TerminationCause::UnrecoveredFault(fault)
}

fn startup_failure(
    resources: &mut RunResources,
    internal: &CancellationToken,
    logger: &Logger,
    error: BoxError,
) -> TerminationCause {
    logger.log(
        LogLevel::Fatal,
        "startup failed",
        Some(&json!({ "error": error.to_string() })),
    );
    fault_or(resources, internal, logger, TerminationCause::Startup(error))
}

/// A fault that reached the host channel during bring-up outranks the
/// bring-up failure it may have caused.
fn fault_or(
    resources: &mut RunResources,
    internal: &CancellationToken,
    logger: &Logger,
    cause: TerminationCause,
) -> TerminationCause {
    while let Ok(event) = resources.events.try_recv() {
        match event {
            HostEvent::Fault(fault) => {
                if resources.ledger.record(&fault) {
                    return unrecovered(fault, internal, logger);
                }
            }
            HostEvent::Signal(signal) => on_signal(resources, signal, internal, logger),
        }
    }
    cause
}

fn on_signal(
    resources: &mut RunResources,
    signal: Signal,
    internal: &CancellationToken,
    logger: &Logger,
) {
    if resources.signal.is_some() {
        logger.debug(&format!("ignoring repeated {signal}"));
        return;
    }
    resources.signal = Some(signal);
    logger.warning(&format!("received {signal}, cancelling run"));
    internal.cancel_with(CancelReason::new(format!("received {signal}")));
}

/// How loudly to report the entry point's error, if it returned one.
///
/// An error caused by the run's own cancellation is expected; any other error
/// during an aborted run is suspicious; outside cancellation it is a failure.
fn entry_error_level(observation: &Observation) -> Option<LogLevel> {
    let error = observation.entry_error.as_ref()?;
    let error: &(dyn std::error::Error + 'static) = error.as_ref();
    Some(match &observation.internal {
        Some(reason) if reason.is_cause_of(error) => LogLevel::Info,
        Some(_) => LogLevel::Warning,
        None => LogLevel::Error,
    })
}

fn report_entry_error(observation: &Observation, logger: &Logger) {
    let Some(level) = entry_error_level(observation) else {
        return;
    };
    let Some(error) = &observation.entry_error else {
        return;
    };
    let message = match level {
        LogLevel::Info => "entry point stopped on cancellation",
        LogLevel::Warning => "error raised while aborted",
        _ => "entry point failed",
    };
    logger.log(level, message, Some(&json!({ "error": error.to_string() })));
}

/// Poll the entry point and host events until the entry point finishes or a
/// new fault arrives.
async fn run_loop(
    body: BoxFuture<'static, Result<(), BoxError>>,
    resources: &mut RunResources,
    internal: &CancellationToken,
    logger: &Logger,
) -> Ended {
    let mut body = AssertUnwindSafe(body).catch_unwind();

    loop {
        tokio::select! {
            biased;

            Some(event) = resources.events.recv() => match event {
                HostEvent::Fault(fault) => {
                    if resources.ledger.record(&fault) {
                        return Ended::Fault(fault);
                    }
                }
                HostEvent::Signal(signal) => on_signal(resources, signal, internal, logger),
            },

            result = &mut body => {
                return match result {
                    Ok(Ok(())) => Ended::Returned(None),
                    Ok(Err(error)) => Ended::Returned(Some(error)),
                    Err(payload) => {
                        let fault = Fault::from_panic_payload(payload.as_ref());
                        resources.ledger.record(&fault);
                        Ended::Fault(fault)
                    }
                };
            }
        }
    }
}

impl<C: AppConfig> fmt::Debug for App<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}
