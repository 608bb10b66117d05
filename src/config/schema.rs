//! Configuration schema definitions.
//!
//! Every app config embeds [`BaseConfig`] (usually with `#[serde(flatten)]`)
//! and implements [`AppConfig`] so the runtime can reach the log, dry-run and
//! metrics settings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::validation::ValidationError;

/// Log threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The equivalent `EnvFilter` directive.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Compact `key=value` lines.
    Logfmt,
}

/// What [`Logger::console`](crate::Logger::console) does with direct
/// console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConsoleUse {
    /// Print to stdout as is.
    #[default]
    Accepted,
    /// Emit as an info event.
    ToLog,
    /// Drop it and warn that the logger should be used.
    BlockAndWarn,
    /// Drop it silently.
    Block,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub console: ConsoleUse,
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Listener address for `GET /metrics`.
    pub bind_address: String,

    /// Bucket bounds used for every histogram, in ascending order.
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            histogram_buckets: vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Settings every app config carries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BaseConfig {
    pub log: LogConfig,

    /// Run the whole lifecycle but skip the entry point.
    pub dry_run: bool,

    pub metrics: MetricsConfig,
}

/// Implemented by application config types.
pub trait AppConfig: DeserializeOwned + Send + Sync + 'static {
    fn base(&self) -> &BaseConfig;

    /// App-specific semantic checks, run after deserialization.
    fn validate(&self) -> Vec<ValidationError> {
        Vec::new()
    }
}

impl AppConfig for BaseConfig {
    fn base(&self) -> &BaseConfig {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BaseConfig::default();
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.console, ConsoleUse::Accepted);
        assert!(!config.dry_run);
        assert_eq!(config.metrics.bind_address, "0.0.0.0:9090");
    }

    #[test]
    fn test_level_names() {
        let config: BaseConfig = toml::from_str(
            r#"
            dry_run = true
            [log]
            level = "warning"
            format = "logfmt"
            console = "block-and-warn"
            "#,
        )
        .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.log.level, LogLevel::Warning);
        assert_eq!(config.log.format, LogFormat::Logfmt);
        assert_eq!(config.log.console, ConsoleUse::BlockAndWarn);
        assert_eq!(LogLevel::Fatal.as_directive(), "error");
    }

    #[test]
    fn test_flattened_app_config() {
        #[derive(Deserialize)]
        struct MyConfig {
            #[serde(flatten)]
            base: BaseConfig,
            endpoint: String,
        }

        let config: MyConfig = toml::from_str(
            r#"
            endpoint = "http://localhost"
            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint, "http://localhost");
        assert_eq!(config.base.log.level, LogLevel::Debug);
    }
}
