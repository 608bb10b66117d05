//! Shared utilities for lifecycle integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use service_bootstrap::lifecycle::ManualHost;
use service_bootstrap::{App, AppBuilder, BaseConfig, ConfigSource};

/// Inline config with the metrics listener on an ephemeral local port.
///
/// `extra` is placed before the `[metrics]` table, so it may hold top-level
/// keys and other tables.
pub fn test_config(extra: &str) -> ConfigSource {
    ConfigSource::inline(format!(
        "{extra}\n\n[metrics]\nbind_address = \"127.0.0.1:0\"\n"
    ))
}

/// A builder wired to a manual host and an ephemeral metrics port.
pub fn test_app(name: &str, extra: &str) -> (AppBuilder<BaseConfig>, ManualHost) {
    let host = ManualHost::new();
    let builder = App::<BaseConfig>::builder(name)
        .version("0.0.0-test")
        .config_source(test_config(extra))
        .host(host.clone());
    (builder, host)
}

/// A flag flipped when the guard is dropped.
#[allow(dead_code)]
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
