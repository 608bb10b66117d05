//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;

use crate::config::loader::{load_config, ConfigSource, Loaded};
use crate::config::schema::AppConfig;

/// A changed configuration leaf, keyed by dotted path.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    /// e.g. `log.level`.
    pub path: String,
    /// New value; `None` when the key was removed.
    pub value: Option<toml::Value>,
}

type ChangeHook = Box<dyn Fn(&ConfigChange) + Send + Sync>;

/// Holds the current config and fans out changes after a reload.
pub struct ConfigWatcher<C> {
    current: ArcSwap<C>,
    raw: ArcSwap<toml::Value>,
    changes: broadcast::Sender<ConfigChange>,
    hooks: Mutex<Vec<(String, ChangeHook)>>,
}

impl<C: AppConfig> ConfigWatcher<C> {
    pub fn new(initial: Loaded<C>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            current: ArcSwap::from_pointee(initial.config),
            raw: ArcSwap::from_pointee(initial.raw),
            changes,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// The latest accepted configuration.
    pub fn current(&self) -> Arc<C> {
        self.current.load_full()
    }

    /// Receive every change published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// Run `hook` for changes at exactly `path`.
    pub fn on_change<F>(&self, path: impl Into<String>, hook: F)
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((path.into(), Box::new(hook)));
        }
    }

    /// Swap in a freshly loaded config and publish what changed.
    pub fn apply(&self, loaded: Loaded<C>) -> Vec<ConfigChange> {
        let previous = self.raw.load_full();
        let mut changes = Vec::new();
        diff("", &previous, &loaded.raw, &mut changes);

        self.current.store(Arc::new(loaded.config));
        self.raw.store(Arc::new(loaded.raw));

        if let Ok(hooks) = self.hooks.lock() {
            for change in &changes {
                for (path, hook) in hooks.iter() {
                    if *path == change.path {
                        hook(change);
                    }
                }
            }
        }
        for change in &changes {
            // No receivers is fine.
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    /// Start watching `path`, reloading through `source` on modification.
    ///
    /// Watching stops when the returned watcher is dropped.
    pub fn watch(
        self: &Arc<Self>,
        name: &str,
        source: &ConfigSource,
        path: &Path,
    ) -> Result<RecommendedWatcher, notify::Error> {
        let this = Arc::clone(self);
        let name = name.to_string();
        let source = source.clone().file(path);
        let watched: PathBuf = path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        match load_config::<C>(&name, &source) {
                            Ok(loaded) => {
                                let changes = this.apply(loaded);
                                if !changes.is_empty() {
                                    let paths: Vec<&str> =
                                        changes.iter().map(|c| c.path.as_str()).collect();
                                    tracing::info!(changes = ?paths, "Configuration change detected");
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to reload config: {}. Keeping current configuration.", e);
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!("Config watch error: {:?}", e),
            }
        }, Config::default().with_poll_interval(Duration::from_secs(2)))?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?watched, "Config watcher started");
        Ok(watcher)
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Collect changed leaves between two documents.
fn diff(prefix: &str, old: &toml::Value, new: &toml::Value, out: &mut Vec<ConfigChange>) {
    match (old, new) {
        (toml::Value::Table(old), toml::Value::Table(new)) => {
            for (key, old_value) in old {
                let path = join(prefix, key);
                match new.get(key) {
                    Some(new_value) => diff(&path, old_value, new_value, out),
                    None => out.push(ConfigChange { path, value: None }),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    out.push(ConfigChange {
                        path: join(prefix, key),
                        value: Some(new_value.clone()),
                    });
                }
            }
        }
        (old, new) if old != new => out.push(ConfigChange {
            path: prefix.to_string(),
            value: Some(new.clone()),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config_with_env;
    use crate::config::schema::{BaseConfig, LogLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loaded(toml: &str) -> Loaded<BaseConfig> {
        load_config_with_env("app", &ConfigSource::inline(toml), &[]).unwrap()
    }

    #[test]
    fn test_diff_reports_changed_leaves_only() {
        let old: toml::Value = toml::from_str("a = 1\n[log]\nlevel = 'info'\nformat = 'json'\n").unwrap();
        let new: toml::Value = toml::from_str("b = 2\n[log]\nlevel = 'debug'\nformat = 'json'\n").unwrap();

        let mut changes = Vec::new();
        diff("", &old, &new, &mut changes);

        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "log.level", "b"]);
        assert_eq!(changes[0].value, None);
        assert_eq!(changes[1].value, Some(toml::Value::String("debug".into())));
    }

    #[test]
    fn test_apply_swaps_and_notifies() {
        let watcher = ConfigWatcher::new(loaded("[log]\nlevel = 'info'\n"));
        let mut rx = watcher.subscribe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        watcher.on_change("log.level", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let changes = watcher.apply(loaded("[log]\nlevel = 'debug'\n"));
        assert_eq!(changes.len(), 1);
        assert_eq!(watcher.current().log.level, LogLevel::Debug);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap().path, "log.level");

        let changes = watcher.apply(loaded("[log]\nlevel = 'debug'\n"));
        assert!(changes.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
