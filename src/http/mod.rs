//! HTTP exposition subsystem.
//!
//! # Data Flow
//! ```text
//! Scraper ──GET /metrics──▶ server.rs ──render──▶ MetricsRegistry
//! ```
//!
//! # Design Decisions
//! - Axum router with shared state, one route
//! - Graceful shutdown tied to the run's cancellation token

pub mod server;

pub use server::MetricsServer;
