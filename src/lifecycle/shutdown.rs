//! Run teardown.
//!
//! # Order
//! ```text
//! cancel run token → stop metrics listener → stop config watcher
//!     → detach cancellation chain → uninstall host traps
//!     → drain pending host events → clear fault ledger → drain logs
//! ```
//!
//! Every exit path of a run goes through [`RunResources::teardown`].

use notify::RecommendedWatcher;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::schema::LogLevel;
use crate::http::server::MetricsServer;
use crate::lifecycle::cancellation::CancelReason;
use crate::lifecycle::chain::CancellationChain;
use crate::lifecycle::signals::{FaultLedger, HostEvent, HostTraps, Signal};
use crate::observability::logging::Logger;

/// Everything a run acquires and must release.
pub(crate) struct RunResources {
    pub chain: CancellationChain,
    pub traps: Option<Box<dyn HostTraps>>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    pub ledger: FaultLedger,
    /// First signal received by the run; later ones are ignored.
    pub signal: Option<Signal>,
    pub metrics_server: Option<MetricsServer>,
    pub config_watcher: Option<RecommendedWatcher>,
}

impl RunResources {
    pub fn new(
        chain: CancellationChain,
        traps: Box<dyn HostTraps>,
        events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> Self {
        Self {
            chain,
            traps: Some(traps),
            events,
            ledger: FaultLedger::new(),
            signal: None,
            metrics_server: None,
            config_watcher: None,
        }
    }

    /// Release everything in order. Returns whether the log drain finished
    /// in time.
    pub async fn teardown(mut self, logger: &Logger) -> bool {
        self.chain
            .token()
            .cancel_with(CancelReason::new("run finished"));

        if let Some(server) = self.metrics_server.take() {
            server.stop().await;
        }
        drop(self.config_watcher.take());

        self.chain.detach_all();
        if let Some(traps) = self.traps.take() {
            traps.uninstall();
        }

        while let Ok(event) = self.events.try_recv() {
            match event {
                HostEvent::Fault(fault) => {
                    if self.ledger.record(&fault) {
                        logger.log(
                            LogLevel::Error,
                            "fault raised during teardown",
                            Some(&json!({ "fault": fault.to_string() })),
                        );
                    }
                }
                HostEvent::Signal(signal) => {
                    logger.debug(&format!("ignoring {signal} received during teardown"));
                }
            }
        }
        self.ledger.clear();

        let drained = logger.wait_for_idle().await;
        if !drained {
            tracing::warn!("Log drain timed out");
        }
        drained
    }
}
