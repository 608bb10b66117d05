//! Lazily resolving, memoizing service registry.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use thiserror::Error;

use crate::config::schema::AppConfig;
use crate::config::watcher::ConfigWatcher;
use crate::container::builtins::{is_reserved, Builtins, ServiceValue};
use crate::ids::IdGenerator;
use crate::lifecycle::cancellation::CancellationToken;
use crate::observability::logging::Logger;
use crate::observability::metrics::Metrics;
use crate::BoxError;

/// Errors raised while building or resolving services.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("cyclic dependency detected: {}", .chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("service name '{0}' is reserved for a built-in service")]
    ReservedName(String),

    #[error("service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("failed to build service '{name}': {source}")]
    Factory { name: String, source: BoxError },
}

type Factory = Arc<dyn Fn(&ServiceContainer) -> Result<ServiceValue, BoxError> + Send + Sync>;

/// User service factories, keyed by name.
#[derive(Default, Clone)]
pub struct ServiceDefinitions {
    factories: Vec<(String, Factory)>,
}

impl ServiceDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. A later registration of the same name
    /// replaces the earlier one.
    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceContainer) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: Factory =
            Arc::new(move |container| factory(container).map(|v| Arc::new(v) as ServiceValue));
        self.factories.retain(|(existing, _)| *existing != name);
        self.factories.push((name, factory));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceContainer) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Reject any definition named like a built-in.
    pub fn check_reserved(&self) -> Result<(), ContainerError> {
        match self.names().find(|name| is_reserved(name)) {
            Some(name) => Err(ContainerError::ReservedName(name.to_string())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServiceDefinitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

enum EntryState {
    Unresolved,
    /// Being built by the given thread.
    Building(ThreadId),
    Resolved(ServiceValue),
}

struct Entry {
    factory: Factory,
    state: EntryState,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    /// Names each thread is currently building, outermost first.
    resolving: HashMap<ThreadId, Vec<String>>,
    /// The service each blocked thread is waiting for.
    waiting: HashMap<ThreadId, String>,
}

impl Registry {
    fn owner(&self, name: &str) -> Option<ThreadId> {
        match self.entries.get(name).map(|e| &e.state) {
            Some(EntryState::Building(owner)) => Some(*owner),
            _ => None,
        }
    }

    /// Whether `owner` is, through the threads it waits on, waiting for `me`.
    fn waits_on(&self, owner: ThreadId, me: ThreadId) -> bool {
        let mut current = owner;
        let mut hops = 0;
        while hops <= self.waiting.len() {
            if current == me {
                return true;
            }
            match self.waiting.get(&current).and_then(|name| self.owner(name)) {
                Some(next) => current = next,
                None => return false,
            }
            hops += 1;
        }
        false
    }

    fn cycle(&self, me: ThreadId, name: &str) -> ContainerError {
        let mut chain = self.resolving.get(&me).cloned().unwrap_or_default();
        chain.push(name.to_string());
        ContainerError::CyclicDependency { chain }
    }

    fn finish(&mut self, me: ThreadId, name: &str, state: EntryState) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.state = state;
        }
        if let Some(stack) = self.resolving.get_mut(&me) {
            stack.pop();
            if stack.is_empty() {
                self.resolving.remove(&me);
            }
        }
    }
}

/// Resolves services on first access and caches them for the run.
///
/// Re-entering a service from its own factory (directly or through other
/// services) is a cycle. A thread asking for a service another thread is
/// building blocks until that build finishes; if the two builds wait on each
/// other, the second one to block gets the cycle error.
pub struct ServiceContainer {
    this: Weak<ServiceContainer>,
    builtins: Builtins,
    registry: Mutex<Registry>,
    built: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ServiceContainer {
    /// Build a container. Reserved names are rejected here, before any
    /// factory runs.
    pub fn new(
        builtins: Builtins,
        definitions: ServiceDefinitions,
    ) -> Result<Arc<Self>, ContainerError> {
        definitions.check_reserved()?;

        let entries = definitions
            .factories
            .into_iter()
            .map(|(name, factory)| {
                (
                    name,
                    Entry {
                        factory,
                        state: EntryState::Unresolved,
                    },
                )
            })
            .collect();

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            builtins,
            registry: Mutex::new(Registry {
                entries,
                ..Registry::default()
            }),
            built: Condvar::new(),
        }))
    }

    /// Resolve `name`, building it on first access.
    pub fn resolve(&self, name: &str) -> Result<ServiceValue, ContainerError> {
        if name == "container" {
            return self
                .this
                .upgrade()
                .map(|this| this as ServiceValue)
                .ok_or_else(|| ContainerError::UnknownService(name.to_string()));
        }
        if let Some(value) = self.builtins.value(name) {
            return Ok(value);
        }

        let me = thread::current().id();
        let factory = {
            let mut registry = lock(&self.registry);
            loop {
                let Some(entry) = registry.entries.get_mut(name) else {
                    return Err(ContainerError::UnknownService(name.to_string()));
                };
                match &entry.state {
                    EntryState::Resolved(value) => return Ok(value.clone()),
                    EntryState::Unresolved => {
                        entry.state = EntryState::Building(me);
                        let factory = entry.factory.clone();
                        registry
                            .resolving
                            .entry(me)
                            .or_default()
                            .push(name.to_string());
                        break factory;
                    }
                    EntryState::Building(owner) => {
                        let owner = *owner;
                        if registry.waits_on(owner, me) {
                            return Err(registry.cycle(me, name));
                        }
                        registry.waiting.insert(me, name.to_string());
                        registry = self
                            .built
                            .wait(registry)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        registry.waiting.remove(&me);
                    }
                }
            }
        };

        tracing::debug!(service = name, "Building service");
        let built = panic::catch_unwind(AssertUnwindSafe(|| factory(self)));

        let mut registry = lock(&self.registry);
        let result = match built {
            Ok(Ok(value)) => {
                registry.finish(me, name, EntryState::Resolved(value.clone()));
                Ok(value)
            }
            Ok(Err(error)) => {
                registry.finish(me, name, EntryState::Unresolved);
                Err(match error.downcast::<ContainerError>() {
                    Ok(inner) => *inner,
                    Err(source) => ContainerError::Factory {
                        name: name.to_string(),
                        source,
                    },
                })
            }
            Err(payload) => {
                registry.finish(me, name, EntryState::Unresolved);
                drop(registry);
                self.built.notify_all();
                panic::resume_unwind(payload);
            }
        };
        drop(registry);
        self.built.notify_all();
        result
    }

    /// Resolve `name` as a `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        self.resolve(name)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Whether `name` was already built.
    pub fn is_resolved(&self, name: &str) -> bool {
        matches!(
            lock(&self.registry).entries.get(name).map(|e| &e.state),
            Some(EntryState::Resolved(_))
        )
    }

    pub fn logger(&self) -> &Logger {
        &self.builtins.logger
    }

    pub fn metrics(&self) -> &Metrics {
        &self.builtins.metrics
    }

    pub fn name(&self) -> &str {
        &self.builtins.name
    }

    pub fn version(&self) -> &str {
        &self.builtins.version
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.builtins.cancellation_token
    }

    pub fn abort_controller(&self) -> &CancellationToken {
        &self.builtins.abort_controller
    }

    pub fn id_generator(&self) -> IdGenerator {
        self.builtins.id_generator
    }

    pub fn config<C: AppConfig>(&self) -> Result<Arc<C>, ContainerError> {
        self.get::<C>("config")
    }

    pub fn config_watcher<C: AppConfig>(&self) -> Result<Arc<ConfigWatcher<C>>, ContainerError> {
        self.get::<ConfigWatcher<C>>("config_watcher")
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = lock(&self.registry).entries.keys().cloned().collect();
        f.debug_struct("ServiceContainer")
            .field("name", &self.builtins.name)
            .field("services", &names)
            .finish()
    }
}
