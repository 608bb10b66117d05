//! Configuration loading from disk, inline text and the environment.
//!
//! Sources are merged in order, later ones overriding earlier ones:
//! 1. the config file (explicit path, `<NAME>_CONFIG_PATH`, or
//!    `/etc/<name>/config.toml` which may be absent)
//! 2. inline TOML
//! 3. environment variables `<name>_<key>`, `__` separating nested keys
//!    (`myapp_log__level=debug` sets `log.level`)

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {origin}: {source}")]
    Parse {
        origin: String,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Deserialize(toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where configuration comes from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    file: Option<PathBuf>,
    inline: Option<String>,
    env: bool,
    discover: bool,
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self {
            file: None,
            inline: None,
            env: true,
            discover: true,
        }
    }
}

impl ConfigSource {
    /// Discover the file, overlay the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the given TOML text: no file discovery, no environment.
    pub fn inline(toml: impl Into<String>) -> Self {
        Self {
            file: None,
            inline: Some(toml.into()),
            env: false,
            discover: false,
        }
    }

    /// Read this file; it must exist.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_inline(mut self, toml: impl Into<String>) -> Self {
        self.inline = Some(toml.into());
        self
    }

    pub fn env(mut self, enabled: bool) -> Self {
        self.env = enabled;
        self
    }

    pub fn discover(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }
}

/// A loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Loaded<C> {
    pub config: C,
    /// Merged raw document the config was deserialized from.
    pub raw: toml::Value,
    /// File that contributed to the config, if any.
    pub path: Option<PathBuf>,
}

/// Load and validate configuration for the app `name`.
pub fn load_config<C: AppConfig>(name: &str, source: &ConfigSource) -> Result<Loaded<C>, ConfigError> {
    let vars: Vec<(String, String)> = if source.env || source.discover {
        std::env::vars().collect()
    } else {
        Vec::new()
    };
    load_config_with_env(name, source, &vars)
}

/// [`load_config`] with an explicit environment.
pub fn load_config_with_env<C: AppConfig>(
    name: &str,
    source: &ConfigSource,
    vars: &[(String, String)],
) -> Result<Loaded<C>, ConfigError> {
    let mut raw = toml::Table::new();
    let mut loaded_path = None;

    if let Some((path, required)) = resolve_path(name, source, vars) {
        match fs::read_to_string(&path) {
            Ok(content) => {
                let table = parse_table(&content, &path.display().to_string())?;
                merge(&mut raw, table);
                loaded_path = Some(path);
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        }
    }

    if let Some(inline) = &source.inline {
        merge(&mut raw, parse_table(inline, "inline config")?);
    }

    if source.env {
        apply_env(&mut raw, name, vars);
    }

    let raw = toml::Value::Table(raw);
    let config: C = raw.clone().try_into().map_err(ConfigError::Deserialize)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(Loaded {
        config,
        raw,
        path: loaded_path,
    })
}

fn env_prefix(name: &str) -> String {
    name.replace('-', "_")
}

fn resolve_path(
    name: &str,
    source: &ConfigSource,
    vars: &[(String, String)],
) -> Option<(PathBuf, bool)> {
    if let Some(file) = &source.file {
        return Some((file.clone(), true));
    }
    if !source.discover {
        return None;
    }

    let key = format!("{}_CONFIG_PATH", env_prefix(name));
    let from_env = vars
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        .map(|(_, v)| PathBuf::from(v));

    match from_env {
        Some(path) => Some((path, true)),
        None => Some((Path::new("/etc").join(name).join("config.toml"), false)),
    }
}

fn parse_table(content: &str, origin: &str) -> Result<toml::Table, ConfigError> {
    content.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

/// Deep-merge `overlay` into `base`; overlay wins on conflicts.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env(raw: &mut toml::Table, name: &str, vars: &[(String, String)]) {
    let prefix = format!("{}_", env_prefix(name)).to_ascii_lowercase();

    for (key, value) in vars {
        let lower = key.to_ascii_lowercase();
        let Some(rest) = lower.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() || rest == "config_path" {
            continue;
        }
        let path: Vec<&str> = rest.split("__").collect();
        if path.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        insert_path(raw, &path, parse_env_value(value));
    }
}

fn insert_path(table: &mut toml::Table, path: &[&str], value: toml::Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = table;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        let toml::Value::Table(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Interpret an env value as a TOML scalar, falling back to a plain string.
fn parse_env_value(raw: &str) -> toml::Value {
    format!("v = {raw}")
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BaseConfig, LogFormat, LogLevel};

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_inline_config() {
        let source = ConfigSource::inline("dry_run = true\n[log]\nlevel = 'debug'\n");
        let loaded: Loaded<BaseConfig> = load_config_with_env("app", &source, &[]).unwrap();
        assert!(loaded.config.dry_run);
        assert_eq!(loaded.config.log.level, LogLevel::Debug);
        assert!(loaded.path.is_none());
    }

    #[test]
    fn test_env_overlay_wins() {
        let source = ConfigSource::inline("[log]\nlevel = 'info'\n").env(true);
        let env = vars(&[
            ("my_app_log__level", "debug"),
            ("MY_APP_LOG__FORMAT", "logfmt"),
            ("my_app_dry_run", "true"),
            ("other_log__level", "trace"),
        ]);
        let loaded: Loaded<BaseConfig> = load_config_with_env("my-app", &source, &env).unwrap();
        assert_eq!(loaded.config.log.level, LogLevel::Debug);
        assert_eq!(loaded.config.log.format, LogFormat::Logfmt);
        assert!(loaded.config.dry_run);
    }

    #[test]
    fn test_env_values_fall_back_to_strings() {
        assert_eq!(parse_env_value("42"), toml::Value::Integer(42));
        assert_eq!(parse_env_value("true"), toml::Value::Boolean(true));
        assert_eq!(
            parse_env_value("http://example.com"),
            toml::Value::String("http://example.com".into())
        );
    }

    #[test]
    fn test_missing_default_file_is_empty() {
        let source = ConfigSource::new().env(false);
        let loaded: Loaded<BaseConfig> =
            load_config_with_env("surely-not-installed-app", &source, &[]).unwrap();
        assert_eq!(loaded.config, BaseConfig::default());
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let source = ConfigSource::new().file("/nonexistent/config.toml").env(false);
        let err = load_config_with_env::<BaseConfig>("app", &source, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_file_from_env_var() {
        let path = std::env::temp_dir().join(format!("sb-loader-{}.toml", std::process::id()));
        fs::write(&path, "[log]\nformat = 'logfmt'\n").unwrap();

        let env = vars(&[("APP_CONFIG_PATH", path.to_str().unwrap())]);
        let loaded: Loaded<BaseConfig> =
            load_config_with_env("app", &ConfigSource::new().env(false), &env).unwrap();
        assert_eq!(loaded.config.log.format, LogFormat::Logfmt);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));

        fs::remove_file(path).unwrap_or_default();
    }

    #[test]
    fn test_parse_and_shape_errors() {
        let err = load_config_with_env::<BaseConfig>("app", &ConfigSource::inline("[log"), &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = load_config_with_env::<BaseConfig>(
            "app",
            &ConfigSource::inline("[log]\nlevel = 'loud'\n"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Deserialize(_)));
    }

    #[test]
    fn test_validation_error_display() {
        let err = load_config_with_env::<BaseConfig>(
            "app",
            &ConfigSource::inline("[metrics]\nbind_address = 'nowhere'\n"),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Validation failed: metrics.bind_address"));
    }
}
