//! Host environment: OS signals and process-wide fault traps.
//!
//! # Responsibilities
//! - Register SIGTERM/SIGINT handlers and forward them as [`HostEvent`]s
//! - Install a panic hook reporting panics from any thread as faults
//! - Restore the previous handlers on `uninstall`
//!
//! # Design Decisions
//! - All process-wide mutable state lives behind [`HostEnvironment`] so a run
//!   can be driven by [`ManualHost`] in tests
//! - Events are pushed into a channel owned by the run loop; the host never
//!   decides what a signal means
//! - The same panic may be reported twice (hook + unwind guard); the
//!   [`FaultLedger`] filters repeats by identity

use std::any::Any;
use std::fmt;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Termination signals trapped for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGTERM.
    Terminate,
    /// SIGINT.
    Interrupt,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An unrecovered fault reported by the host (a panic, in practice).
#[derive(Debug, Clone)]
pub struct Fault {
    message: String,
    location: Option<String>,
    thread: ThreadId,
}

impl Fault {
    /// A fault raised on the current thread.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            thread: std::thread::current().id(),
        }
    }

    pub fn from_panic_info(info: &PanicHookInfo<'_>) -> Self {
        Self {
            message: panic_message(info.payload()),
            location: info.location().map(|l| l.to_string()),
            thread: std::thread::current().id(),
        }
    }

    /// Build a fault from a payload caught by an unwind guard on this thread.
    pub fn from_panic_payload(payload: &(dyn Any + Send)) -> Self {
        Self::new(panic_message(payload))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    fn key(&self) -> (ThreadId, String) {
        (self.thread, self.message.clone())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Fault {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Remembers which faults were already handled during a run.
///
/// A panic inside the entry point is seen both by the panic hook and by the
/// unwind guard around the entry point. Keyed on thread and message.
#[derive(Debug, Default)]
pub struct FaultLedger {
    seen: DashSet<(ThreadId, String)>,
}

impl FaultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a fault is recorded.
    pub fn record(&self, fault: &Fault) -> bool {
        self.seen.insert(fault.key())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }
}

/// Something the host observed that may end the run.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Signal(Signal),
    Fault(Fault),
}

/// Errors raised while installing host traps.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to register signal handler: {0}")]
    Signal(#[from] std::io::Error),

    #[error("host traps are already installed by another run")]
    AlreadyInstalled,

    #[error("host traps require a running tokio runtime")]
    NoRuntime,
}

/// Installs process-wide traps for one run.
pub trait HostEnvironment: Send + Sync {
    fn install(
        &self,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn HostTraps>, HostError>;
}

/// Traps installed by a [`HostEnvironment`]; removed by `uninstall`.
pub trait HostTraps: Send {
    fn uninstall(self: Box<Self>);
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

static OS_TRAPS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// The real host: tokio signal streams and the std panic hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsHost;

impl HostEnvironment for OsHost {
    fn install(
        &self,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn HostTraps>, HostError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(HostError::NoRuntime);
        }
        if OS_TRAPS_INSTALLED.swap(true, Ordering::AcqRel) {
            return Err(HostError::AlreadyInstalled);
        }

        let signal_task = match spawn_signal_listener(events.clone()) {
            Ok(task) => task,
            Err(e) => {
                OS_TRAPS_INSTALLED.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let previous: Arc<PanicHook> = Arc::new(std::panic::take_hook());
        let chained = previous.clone();
        std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            let _ = events.send(HostEvent::Fault(Fault::from_panic_info(info)));
            chained(info);
        }));

        tracing::debug!("Host traps installed");
        Ok(Box::new(OsTraps {
            signal_task,
            previous,
        }))
    }
}

#[cfg(unix)]
fn spawn_signal_listener(
    events: mpsc::UnboundedSender<HostEvent>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                v = terminate.recv() => v.map(|_| Signal::Terminate),
                v = interrupt.recv() => v.map(|_| Signal::Interrupt),
            };
            let Some(signal) = received else { break };
            if events.send(HostEvent::Signal(signal)).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(
    events: mpsc::UnboundedSender<HostEvent>,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if events.send(HostEvent::Signal(Signal::Interrupt)).is_err() {
                break;
            }
        }
    }))
}

struct OsTraps {
    signal_task: JoinHandle<()>,
    previous: Arc<PanicHook>,
}

impl HostTraps for OsTraps {
    fn uninstall(self: Box<Self>) {
        self.signal_task.abort();
        let _ours = std::panic::take_hook();
        let previous = self.previous;
        std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| previous(info)));
        OS_TRAPS_INSTALLED.store(false, Ordering::Release);
        tracing::debug!("Host traps removed");
    }
}

#[derive(Default)]
struct ManualInner {
    sender: Mutex<Option<mpsc::UnboundedSender<HostEvent>>>,
    installs: AtomicUsize,
    uninstalls: AtomicUsize,
}

/// A host driven by hand, for tests and embedding.
///
/// Signals and faults are delivered only while a run has the traps installed.
#[derive(Clone, Default)]
pub struct ManualHost {
    inner: Arc<ManualInner>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `signal`. Returns `false` if no run is listening.
    pub fn signal(&self, signal: Signal) -> bool {
        self.send(HostEvent::Signal(signal))
    }

    /// Report `fault`. Returns `false` if no run is listening.
    pub fn fault(&self, fault: Fault) -> bool {
        self.send(HostEvent::Fault(fault))
    }

    pub fn is_installed(&self) -> bool {
        self.inner
            .sender
            .lock()
            .map(|sender| sender.is_some())
            .unwrap_or(false)
    }

    pub fn install_count(&self) -> usize {
        self.inner.installs.load(Ordering::SeqCst)
    }

    pub fn uninstall_count(&self) -> usize {
        self.inner.uninstalls.load(Ordering::SeqCst)
    }

    fn send(&self, event: HostEvent) -> bool {
        match self.inner.sender.lock() {
            Ok(sender) => sender
                .as_ref()
                .map(|tx| tx.send(event).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ManualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualHost")
            .field("installed", &self.is_installed())
            .field("installs", &self.install_count())
            .finish()
    }
}

impl HostEnvironment for ManualHost {
    fn install(
        &self,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Box<dyn HostTraps>, HostError> {
        let mut sender = self
            .inner
            .sender
            .lock()
            .map_err(|_| HostError::AlreadyInstalled)?;
        if sender.is_some() {
            return Err(HostError::AlreadyInstalled);
        }
        *sender = Some(events);
        self.inner.installs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualTraps {
            inner: self.inner.clone(),
        }))
    }
}

struct ManualTraps {
    inner: Arc<ManualInner>,
}

impl HostTraps for ManualTraps {
    fn uninstall(self: Box<Self>) {
        if let Ok(mut sender) = self.inner.sender.lock() {
            sender.take();
        }
        self.inner.uninstalls.fetch_add(1, Ordering::SeqCst);
    }
}
