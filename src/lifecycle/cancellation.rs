//! One-way cancellation tokens carrying a reason.
//!
//! # Design Decisions
//! - The first `cancel` wins; later calls neither re-fire listeners nor
//!   replace the reason
//! - Listeners run outside the lock, in registration order
//! - Reasons are compared by identity so callers can tell "my own abort
//!   bubbled back up" apart from an unrelated error

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

/// The reason attached to a cancelled token.
///
/// Clones share identity; use [`CancelReason::ptr_eq`] to compare.
#[derive(Clone)]
pub struct CancelReason(Arc<str>);

impl CancelReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Arc::from(message.into()))
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    /// True when both values originate from the same `CancelReason::new`.
    pub fn ptr_eq(&self, other: &CancelReason) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True when `error` is this reason or wraps it somewhere in its
    /// `source()` chain.
    pub fn is_cause_of(&self, error: &(dyn Error + 'static)) -> bool {
        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(reason) = err.downcast_ref::<CancelReason>() {
                if reason.ptr_eq(self) {
                    return true;
                }
            }
            current = err.source();
        }
        false
    }
}

impl fmt::Debug for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelReason").field(&self.message()).finish()
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl Error for CancelReason {}

type Listener = Box<dyn FnOnce(&CancelReason) + Send>;

#[derive(Default)]
struct State {
    reason: Option<CancelReason>,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    state: Mutex<State>,
    notify: Notify,
    next_listener: AtomicU64,
}

impl Inner {
    // Listener callbacks never run under the lock, so a poisoned mutex only
    // means a panic happened between two plain field writes.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An observable, one-way cancellation flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The reason recorded by the first successful `cancel`.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.lock().reason.clone()
    }

    /// Cancel with a generic reason.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::new("cancelled"))
    }

    /// Cancel with `reason`.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the
    /// token was already cancelled.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let listeners = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut state.listeners)
        };

        for (_, listener) in listeners {
            listener(&reason);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Register a callback run once on cancellation.
    ///
    /// Runs immediately if the token is already cancelled.
    pub fn on_cancel<F>(&self, listener: F) -> ListenerHandle
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();
        let existing = state.reason.clone();
        match existing {
            Some(reason) => {
                drop(state);
                listener(&reason);
                ListenerHandle::inert()
            }
            None => {
                state.listeners.push((id, Box::new(listener)));
                ListenerHandle {
                    token: Arc::downgrade(&self.inner),
                    id,
                }
            }
        }
    }

    /// Number of listeners still waiting for cancellation.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Owned variant of [`cancelled`](Self::cancelled), usable as a
    /// `'static` shutdown future.
    pub async fn cancelled_owned(self) {
        self.cancelled().await;
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Detaches a listener when dropped or when [`detach`](Self::detach) is called.
#[must_use = "dropping the handle detaches the listener"]
pub struct ListenerHandle {
    token: Weak<Inner>,
    id: u64,
}

impl ListenerHandle {
    fn inert() -> Self {
        Self {
            token: Weak::new(),
            id: 0,
        }
    }

    pub fn detach(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _handle = token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let first = CancelReason::new("first");
        assert!(token.cancel_with(first.clone()));
        assert!(!token.cancel_with(CancelReason::new("second")));

        assert!(token.reason().unwrap().ptr_eq(&first));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let token = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            handles.push(token.on_cancel(move |_| order.lock().unwrap().push(i)));
        }
        token.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_detached_listener_never_runs() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(token.listener_count(), 1);
        handle.detach();
        assert_eq!(token.listener_count(), 0);

        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_on_cancelled_token_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel_with(CancelReason::new("early"));

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let _handle = token.on_cancel(move |reason| {
            *s.lock().unwrap() = Some(reason.message().to_string());
        });
        assert_eq!(seen.lock().unwrap().as_deref(), Some("early"));
    }

    #[test]
    fn test_reason_identity_through_source_chain() {
        #[derive(Debug)]
        struct Wrapper(CancelReason);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl Error for Wrapper {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let reason = CancelReason::new("stop");
        let same_text = CancelReason::new("stop");

        assert!(reason.is_cause_of(&reason.clone()));
        assert!(reason.is_cause_of(&Wrapper(reason.clone())));
        assert!(!reason.is_cause_of(&same_text));
        assert!(!reason.is_cause_of(&Wrapper(same_text)));
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(token.clone().cancelled_owned());

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_concurrent_cancel_first_wins() {
        let token = CancellationToken::new();
        let winners: Vec<_> = (0..8)
            .map(|i| {
                let token = token.clone();
                std::thread::spawn(move || token.cancel_with(CancelReason::new(format!("t{i}"))))
            })
            .collect();
        let won = winners
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1);
    }
}
