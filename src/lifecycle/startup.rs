//! Run bring-up.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Reconfigure logging from `log.level`, `log.format` and `log.console`
//! - Start the config watcher and hook live logging changes
//!
//! # Design Decisions
//! - Fail fast: a config error ends the run before any user code runs
//! - A watcher that cannot start is logged, not fatal

use std::path::Path;
use std::sync::Arc;

use notify::RecommendedWatcher;
use serde_json::json;

use crate::config::loader::{load_config, ConfigError, ConfigSource, Loaded};
use crate::config::schema::{AppConfig, ConsoleUse, LogConfig, LogFormat, LogLevel};
use crate::config::watcher::{ConfigChange, ConfigWatcher};
use crate::observability::logging::{self, Logger};

/// Load the run's configuration, logging a fatal event on failure.
pub(crate) fn acquire_config<C: AppConfig>(
    name: &str,
    source: &ConfigSource,
    logger: &Logger,
) -> Result<Loaded<C>, ConfigError> {
    match load_config::<C>(name, source) {
        Ok(loaded) => {
            logger.log(
                LogLevel::Debug,
                "config loaded",
                Some(&json!({ "path": loaded.path.as_ref().map(|p| p.display().to_string()) })),
            );
            Ok(loaded)
        }
        Err(error) => {
            logger.log(
                LogLevel::Fatal,
                "config load failed",
                Some(&json!({ "error": error.to_string() })),
            );
            Err(error)
        }
    }
}

/// Apply the configured threshold and format to the process subscriber and
/// the console policy to the run's logger.
pub(crate) fn apply_log_config(log: &LogConfig, logger: &Logger) {
    logging::set_format(log.format);
    logging::set_level(log.level);
    logger.set_console_use(log.console);
}

/// Register the live logging hooks and, when `path` is known, watch it.
pub(crate) fn start_watcher<C: AppConfig>(
    watcher: &Arc<ConfigWatcher<C>>,
    name: &str,
    source: &ConfigSource,
    path: Option<&Path>,
    logger: &Logger,
) -> Option<RecommendedWatcher> {
    let scoped = logger.child("config");
    watcher.on_change("log.level", move |change| {
        if let Some(level) = parse_change::<LogLevel>(change) {
            logging::set_level(level);
            scoped.info(&format!("log level changed to {}", level.as_directive()));
        }
    });
    watcher.on_change("log.format", |change| {
        if let Some(format) = parse_change::<LogFormat>(change) {
            logging::set_format(format);
        }
    });
    let console = logger.clone();
    watcher.on_change("log.console", move |change| {
        if let Some(mode) = parse_change::<ConsoleUse>(change) {
            console.set_console_use(mode);
        }
    });

    let Some(path) = path else {
        logger.warning("config watching requested but no config file was loaded");
        return None;
    };

    match watcher.watch(name, source, path) {
        Ok(handle) => Some(handle),
        Err(error) => {
            logger.log(
                LogLevel::Warning,
                "config watcher failed to start",
                Some(&json!({ "error": error.to_string() })),
            );
            None
        }
    }
}

fn parse_change<T: serde::de::DeserializeOwned>(change: &ConfigChange) -> Option<T> {
    change.value.clone().and_then(|value| value.try_into().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_change() {
        let change = ConfigChange {
            path: "log.level".to_string(),
            value: Some(toml::Value::String("debug".to_string())),
        };
        assert_eq!(parse_change::<LogLevel>(&change), Some(LogLevel::Debug));

        let removed = ConfigChange {
            path: "log.level".to_string(),
            value: None,
        };
        assert_eq!(parse_change::<LogLevel>(&removed), None);

        let bogus = ConfigChange {
            path: "log.level".to_string(),
            value: Some(toml::Value::String("loud".to_string())),
        };
        assert_eq!(parse_change::<LogLevel>(&bogus), None);
    }

    #[test]
    fn test_console_policy_follows_config() {
        let logger = Logger::new("test", tracing::Span::none());
        let log = LogConfig {
            console: ConsoleUse::Block,
            ..LogConfig::default()
        };
        apply_log_config(&log, &logger);
        assert_eq!(logger.child("main").console_use(), ConsoleUse::Block);
    }

    #[test]
    fn test_console_hook_reacts_to_reload() {
        use crate::config::loader::load_config_with_env;
        use crate::config::BaseConfig;

        let source = ConfigSource::inline("[log]\nlevel = \"info\"");
        let loaded = load_config_with_env::<BaseConfig>("app", &source, &[]).unwrap();
        let watcher = Arc::new(ConfigWatcher::new(loaded));
        let logger = Logger::new("test", tracing::Span::none());
        assert!(start_watcher(&watcher, "app", &source, None, &logger).is_none());

        let reloaded = load_config_with_env::<BaseConfig>(
            "app",
            &ConfigSource::inline("[log]\nlevel = \"info\"\nconsole = \"to-log\""),
            &[],
        )
        .unwrap();
        watcher.apply(reloaded);
        assert_eq!(logger.console_use(), ConsoleUse::ToLog);
    }

    #[test]
    fn test_acquire_config_reports_errors() {
        let logger = Logger::new("test", tracing::Span::none());
        let source = ConfigSource::inline("log = 3");
        let result = acquire_config::<crate::config::BaseConfig>("app", &source, &logger);
        assert!(result.is_err());
    }
}
