//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Reconfigure logging → Watch config
//!
//! Run (orchestrator.rs):
//!     Install host traps → Build container → Start metrics listener
//!         → Entry point ⇄ host events (signals.rs)
//!
//! Cancellation (cancellation.rs, chain.rs):
//!     external token ─┐
//!     app controller ─┴─▶ run token ◀── first signal, fault
//!
//! Shutdown (shutdown.rs):
//!     Cancel run token → Stop listener → Uninstall traps → Drain logs
//!
//! Exit (exit.rs):
//!     Observation → TerminationCause → ExitCode
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then services, then listeners
//! - One teardown path for every way a run can end
//! - Process-wide state is touched only through `HostEnvironment`

pub mod cancellation;
pub mod chain;
pub mod exit;
pub mod orchestrator;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use cancellation::{CancelReason, CancellationToken, ListenerHandle};
pub use chain::CancellationChain;
pub use exit::{classify, AbortOrigin, ExitCode, Observation, TerminationCause};
pub use orchestrator::{App, AppBuilder, LifecycleState, RunContext, RunError, RunOutcome};
pub use signals::{
    Fault, FaultLedger, HostEnvironment, HostError, HostEvent, HostTraps, ManualHost, OsHost,
    Signal,
};
