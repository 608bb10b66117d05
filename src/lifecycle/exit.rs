//! Termination classification and exit codes.
//!
//! # Exit codes
//! | Code | Cause |
//! |------|-------|
//! | 0    | normal completion (or no-op run) |
//! | 1    | unrecovered fault, startup failure, unexplained abort |
//! | 2    | configuration could not be loaded |
//! | 3    | entry point failed while not cancelled |
//! | 4    | the app aborted itself through its own controller |
//! | 5    | the caller's cancellation token fired |
//! | 130  | SIGINT |
//! | 143  | SIGTERM |

use std::fmt;

use crate::config::loader::ConfigError;
use crate::lifecycle::cancellation::CancelReason;
use crate::lifecycle::signals::{Fault, Signal};
use crate::BoxError;

/// Process exit code selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    Unexpected = 1,
    InvalidConfig = 2,
    AppError = 3,
    AppAbort = 4,
    ExternalAbort = 5,
    Interrupt = 130,
    Terminate = 143,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }
}

impl From<Signal> for ExitCode {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Interrupt => ExitCode::Interrupt,
            Signal::Terminate => ExitCode::Terminate,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Who requested an internal abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    /// The app's own controller (`abort_controller` service).
    App,
    /// Cancellation with no known source.
    Unknown,
}

/// Why a run left the running state.
#[derive(Debug)]
pub enum TerminationCause {
    NormalCompletion,
    ConfigLoad(ConfigError),
    /// The runtime itself could not bring the run up (reserved service name,
    /// metrics listener bind failure).
    Startup(BoxError),
    ExternalCancellation(CancelReason),
    OsSignal(Signal),
    InternalAbort {
        origin: AbortOrigin,
        reason: Option<CancelReason>,
    },
    UnrecoveredFault(Fault),
    EntryPoint(BoxError),
}

impl TerminationCause {
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self)
    }
}

impl From<&TerminationCause> for ExitCode {
    fn from(cause: &TerminationCause) -> Self {
        match cause {
            TerminationCause::NormalCompletion => ExitCode::Success,
            TerminationCause::ConfigLoad(_) => ExitCode::InvalidConfig,
            TerminationCause::EntryPoint(_) => ExitCode::AppError,
            TerminationCause::ExternalCancellation(_) => ExitCode::ExternalAbort,
            TerminationCause::OsSignal(signal) => ExitCode::from(*signal),
            TerminationCause::InternalAbort {
                origin: AbortOrigin::App,
                ..
            } => ExitCode::AppAbort,
            TerminationCause::InternalAbort {
                origin: AbortOrigin::Unknown,
                ..
            }
            | TerminationCause::Startup(_)
            | TerminationCause::UnrecoveredFault(_) => ExitCode::Unexpected,
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::NormalCompletion => f.write_str("normal completion"),
            TerminationCause::ConfigLoad(e) => write!(f, "config load failed: {e}"),
            TerminationCause::Startup(e) => write!(f, "startup failed: {e}"),
            TerminationCause::ExternalCancellation(r) => write!(f, "cancelled by caller: {r}"),
            TerminationCause::OsSignal(s) => write!(f, "received {s}"),
            TerminationCause::InternalAbort { origin, reason } => match reason {
                Some(r) => write!(f, "aborted ({origin:?}): {r}"),
                None => write!(f, "aborted ({origin:?})"),
            },
            TerminationCause::UnrecoveredFault(fault) => write!(f, "unrecovered fault: {fault}"),
            TerminationCause::EntryPoint(e) => write!(f, "entry point failed: {e}"),
        }
    }
}

/// What the orchestrator saw when the entry point finished.
#[derive(Debug, Default)]
pub struct Observation {
    /// Reason on the run's internal token, if cancelled.
    pub internal: Option<CancelReason>,
    /// Reason on the caller-supplied token, if cancelled.
    pub external: Option<CancelReason>,
    /// Reason on the app's own controller, if cancelled.
    pub app: Option<CancelReason>,
    /// First trapped OS signal.
    pub signal: Option<Signal>,
    /// Error returned by the entry point.
    pub entry_error: Option<BoxError>,
}

/// Pick the termination cause for a run that reached its end normally
/// (no fault, config and startup succeeded).
///
/// When cancellation is active the sources are consulted in priority order:
/// caller token, app controller, OS signal. An entry point error under
/// cancellation does not change the cause.
pub fn classify(observation: Observation) -> TerminationCause {
    let Observation {
        internal,
        external,
        app,
        signal,
        entry_error,
    } = observation;

    match internal {
        Some(reason) => {
            if let Some(external) = external {
                TerminationCause::ExternalCancellation(external)
            } else if let Some(app) = app {
                TerminationCause::InternalAbort {
                    origin: AbortOrigin::App,
                    reason: Some(app),
                }
            } else if let Some(signal) = signal {
                TerminationCause::OsSignal(signal)
            } else {
                TerminationCause::InternalAbort {
                    origin: AbortOrigin::Unknown,
                    reason: Some(reason),
                }
            }
        }
        None => match entry_error {
            Some(error) => TerminationCause::EntryPoint(error),
            None => TerminationCause::NormalCompletion,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason() -> Option<CancelReason> {
        Some(CancelReason::new("stop"))
    }

    #[test]
    fn test_exit_code_table() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Unexpected.code(), 1);
        assert_eq!(ExitCode::InvalidConfig.code(), 2);
        assert_eq!(ExitCode::AppError.code(), 3);
        assert_eq!(ExitCode::AppAbort.code(), 4);
        assert_eq!(ExitCode::ExternalAbort.code(), 5);
        assert_eq!(ExitCode::Interrupt.code(), 130);
        assert_eq!(ExitCode::Terminate.code(), 143);
    }

    #[test]
    fn test_external_token_has_priority() {
        let cause = classify(Observation {
            internal: reason(),
            external: reason(),
            app: reason(),
            signal: Some(Signal::Interrupt),
            entry_error: None,
        });
        assert!(matches!(cause, TerminationCause::ExternalCancellation(_)));
        assert_eq!(cause.exit_code(), ExitCode::ExternalAbort);
    }

    #[test]
    fn test_app_abort_before_signal() {
        let cause = classify(Observation {
            internal: reason(),
            app: reason(),
            signal: Some(Signal::Terminate),
            ..Default::default()
        });
        assert_eq!(cause.exit_code(), ExitCode::AppAbort);
    }

    #[test]
    fn test_signal_codes() {
        for (signal, code) in [
            (Signal::Interrupt, ExitCode::Interrupt),
            (Signal::Terminate, ExitCode::Terminate),
        ] {
            let cause = classify(Observation {
                internal: reason(),
                signal: Some(signal),
                ..Default::default()
            });
            assert_eq!(cause.exit_code(), code);
        }
    }

    #[test]
    fn test_unexplained_cancellation_is_unexpected() {
        let cause = classify(Observation {
            internal: reason(),
            ..Default::default()
        });
        assert!(matches!(
            cause,
            TerminationCause::InternalAbort {
                origin: AbortOrigin::Unknown,
                ..
            }
        ));
        assert_eq!(cause.exit_code(), ExitCode::Unexpected);
    }

    #[test]
    fn test_entry_error_without_cancellation() {
        let cause = classify(Observation {
            entry_error: Some("boom".into()),
            ..Default::default()
        });
        assert_eq!(cause.exit_code(), ExitCode::AppError);
    }

    #[test]
    fn test_entry_error_under_cancellation_keeps_abort_cause() {
        let cause = classify(Observation {
            internal: reason(),
            signal: Some(Signal::Interrupt),
            entry_error: Some("boom".into()),
            ..Default::default()
        });
        assert_eq!(cause.exit_code(), ExitCode::Interrupt);
    }

    #[test]
    fn test_normal_completion() {
        let cause = classify(Observation::default());
        assert_eq!(cause.exit_code(), ExitCode::Success);
    }

    #[test]
    fn test_fault_and_startup_are_unexpected() {
        assert_eq!(
            TerminationCause::UnrecoveredFault(Fault::new("boom")).exit_code(),
            ExitCode::Unexpected
        );
        assert_eq!(
            TerminationCause::Startup("bind".into()).exit_code(),
            ExitCode::Unexpected
        );
    }
}
