//! Services pre-populated by the runtime.

use std::any::Any;
use std::sync::Arc;

use crate::config::schema::AppConfig;
use crate::config::watcher::ConfigWatcher;
use crate::ids::IdGenerator;
use crate::lifecycle::cancellation::CancellationToken;
use crate::observability::logging::Logger;
use crate::observability::metrics::Metrics;

/// Type-erased service value.
pub type ServiceValue = Arc<dyn Any + Send + Sync>;

/// Names user definitions may not use.
pub const RESERVED_NAMES: [&str; 10] = [
    "logger",
    "config",
    "config_watcher",
    "metrics",
    "name",
    "version",
    "cancellation_token",
    "abort_controller",
    "id_generator",
    "container",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// The built-in services of one run.
#[derive(Clone)]
pub struct Builtins {
    pub logger: Logger,
    pub metrics: Metrics,
    pub name: String,
    pub version: String,
    /// The run's cancellation token (observe only).
    pub cancellation_token: CancellationToken,
    /// The app's own cancellation source; cancelling it aborts the run.
    pub abort_controller: CancellationToken,
    pub id_generator: IdGenerator,
    pub(crate) config: ServiceValue,
    pub(crate) config_watcher: ServiceValue,
}

impl Builtins {
    #[allow(clippy::too_many_arguments)]
    pub fn new<C: AppConfig>(
        config: Arc<C>,
        config_watcher: Arc<ConfigWatcher<C>>,
        logger: Logger,
        metrics: Metrics,
        name: impl Into<String>,
        version: impl Into<String>,
        cancellation_token: CancellationToken,
        abort_controller: CancellationToken,
    ) -> Self {
        Self {
            logger,
            metrics,
            name: name.into(),
            version: version.into(),
            cancellation_token,
            abort_controller,
            id_generator: IdGenerator::new(),
            config,
            config_watcher,
        }
    }

    /// Look up a built-in other than `container` by name.
    pub(crate) fn value(&self, name: &str) -> Option<ServiceValue> {
        let value: ServiceValue = match name {
            "logger" => Arc::new(self.logger.clone()),
            "config" => self.config.clone(),
            "config_watcher" => self.config_watcher.clone(),
            "metrics" => Arc::new(self.metrics.clone()),
            "name" => Arc::new(self.name.clone()),
            "version" => Arc::new(self.version.clone()),
            "cancellation_token" => Arc::new(self.cancellation_token.clone()),
            "abort_controller" => Arc::new(self.abort_controller.clone()),
            "id_generator" => Arc::new(self.id_generator),
            _ => return None,
        };
        Some(value)
    }
}
