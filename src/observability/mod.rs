//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Runtime and app code produce:
//!     → logging.rs (structured events inside the run span)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (JSON or logfmt lines)
//!     → GET /metrics (http::server, Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every event carries app, version and run id via the run span
//! - Threshold and format are reconfigured from config after load
//! - One metrics registry per run

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, Logger};
pub use metrics::{MetricDescriptor, Metrics, MetricsError, MetricsRegistry};
