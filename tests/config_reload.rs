//! Live configuration reload through a running app.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use service_bootstrap::config::{ConfigWatcher, LogLevel};
use service_bootstrap::lifecycle::ManualHost;
use service_bootstrap::{App, BaseConfig, BoxError, ConfigSource, ExitCode};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn write_config(path: &std::path::Path, level: &str) {
    std::fs::write(
        path,
        format!("[log]\nlevel = \"{level}\"\n\n[metrics]\nbind_address = \"127.0.0.1:0\"\n"),
    )
    .unwrap();
}

#[tokio::test]
async fn test_watched_file_change_reaches_entry_point() {
    let path = std::env::temp_dir().join(format!("reload-{}.toml", std::process::id()));
    write_config(&path, "info");

    let kept: Arc<Mutex<Option<Arc<ConfigWatcher<BaseConfig>>>>> = Arc::new(Mutex::new(None));
    let k = kept.clone();
    let watched = path.clone();
    let app = App::<BaseConfig>::builder("reload")
        .config_source(ConfigSource::new().env(false).discover(false).file(&path))
        .watch_config(true)
        .host(ManualHost::new())
        .entry_point(move |ctx| {
            let kept = k.clone();
            let path = watched.clone();
            async move {
                let watcher = ctx.container.config_watcher::<BaseConfig>()?;
                *kept.lock().unwrap() = Some(watcher.clone());
                assert_eq!(watcher.current().log.level, LogLevel::Info);

                let mut changes = watcher.subscribe();
                write_config(&path, "debug");

                let mut paths = Vec::new();
                let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
                    loop {
                        match changes.recv().await {
                            Ok(change) => paths.push(change.path),
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => return false,
                        }
                        if watcher.current().log.level == LogLevel::Debug {
                            return true;
                        }
                    }
                })
                .await;

                assert!(matches!(reloaded, Ok(true)));
                assert!(paths.iter().any(|p| p.starts_with("log")));
                Ok::<(), BoxError>(())
            }
        })
        .build();

    let outcome = app.run(None).await.unwrap();
    assert_eq!(outcome.exit_code, ExitCode::Success);

    // The file watcher is gone with the run.
    let watcher = kept.lock().unwrap().take().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut changes = watcher.subscribe();
    write_config(&path, "trace");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(watcher.current().log.level, LogLevel::Debug);
    std::fs::remove_file(&path).ok();
}
