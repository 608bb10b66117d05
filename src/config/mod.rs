//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + inline TOML + <name>_* environment
//!     → loader.rs (parse, merge, deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → shared via Arc with the run and the container
//!
//! With watching enabled:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<C>
//!     → ConfigChange per dotted path (log.level applies live)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a reload swaps the whole value
//! - All base fields have defaults to allow minimal configs
//! - A failed reload keeps the current configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError, ConfigSource, Loaded};
pub use schema::{
    AppConfig, BaseConfig, ConsoleUse, LogConfig, LogFormat, LogLevel, MetricsConfig,
};
pub use validation::ValidationError;
pub use watcher::{ConfigChange, ConfigWatcher};
