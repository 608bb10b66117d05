//! Sample service driven by the bootstrap runtime.
//!
//! # Architecture Overview
//!
//! ```text
//!   CLI flags ──▶ ConfigSource ──▶ App<TickerConfig>
//!                                      │
//!                                      ├── container: ticks (TickCounter)
//!                                      ├── GET /metrics (ticker_* series)
//!                                      └── entry point: tick until cancelled
//! ```
//!
//! Stop it with Ctrl-C (exit 130) or SIGTERM (exit 143).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use metrics::Unit;
use serde::Deserialize;

use service_bootstrap::config::ValidationError;
use service_bootstrap::observability::MetricDescriptor;
use service_bootstrap::{
    services, App, AppConfig, BaseConfig, BoxError, ConfigSource, Metrics, RunContext,
};

#[derive(Parser)]
#[command(name = "service-bootstrap")]
#[command(about = "Sample ticking service", long_about = None)]
struct Cli {
    /// Config file (otherwise $<NAME>_CONFIG_PATH or /etc/<name>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "ticker")]
    name: String,

    /// Load config and build services, but skip the entry point
    #[arg(long)]
    dry_run: bool,

    /// Reload the config file when it changes
    #[arg(short, long)]
    watch: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TickerConfig {
    #[serde(flatten)]
    base: BaseConfig,
    tick_interval_ms: u64,
    /// Stop after this many ticks.
    max_ticks: Option<u64>,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            tick_interval_ms: 1000,
            max_ticks: None,
        }
    }
}

impl AppConfig for TickerConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.tick_interval_ms == 0 {
            errors.push(ValidationError::new("tick_interval_ms", "must be positive"));
        }
        errors
    }
}

struct TickCounter {
    count: AtomicU64,
    counter: metrics::Counter,
}

impl TickCounter {
    fn new(metrics: &Metrics) -> Self {
        Self {
            count: AtomicU64::new(0),
            counter: metrics.counter(&MetricDescriptor::new("ticker_ticks_total", "Ticks so far")),
        }
    }

    fn tick(&self) -> u64 {
        self.counter.increment(1);
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

services! {
    trait TickerServices {
        ticks: TickCounter,
    }
}

async fn run_ticker(ctx: RunContext<TickerConfig>) -> Result<(), BoxError> {
    let ticks = ctx.container.ticks()?;
    let load = ctx
        .metrics
        .gauge(&MetricDescriptor::new("ticker_load", "Simulated load").unit(Unit::Percent));
    let work = ctx.metrics.histogram(
        &MetricDescriptor::new("ticker_work_seconds", "Time spent per tick").unit(Unit::Seconds),
    );

    let mut interval = tokio::time::interval(Duration::from_millis(ctx.config.tick_interval_ms));
    ctx.logger.info("ticking");

    loop {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                ctx.logger.info("stopping");
                return Ok(());
            }
            _ = interval.tick() => {
                let start = Instant::now();
                let n = ticks.tick();
                load.set(fastrand::f64() * 100.0);
                work.record(start.elapsed().as_secs_f64());
                ctx.logger.debug(&format!("tick {n}"));

                if ctx.config.max_ticks.is_some_and(|max| n >= max) {
                    ctx.logger.info("tick budget reached");
                    ctx.logger.console(&format!("ticked {n} times"));
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let mut source = ConfigSource::default();
    if let Some(path) = cli.config {
        source = source.file(path);
    }
    if cli.dry_run {
        source = source.with_inline("dry_run = true");
    }

    let app = App::<TickerConfig>::builder(cli.name)
        .version(env!("CARGO_PKG_VERSION"))
        .config_source(source)
        .watch_config(cli.watch)
        .service("ticks", |container| Ok(TickCounter::new(container.metrics())))
        .entry_point(run_ticker)
        .build();

    app.run_to_exit().await
}
