//! Composition of cancellation sources into one derived token.
//!
//! ```text
//! external token ──┐
//!                  ├──▶ derived token ──▶ run loop, entry point, listeners
//! app abort token ─┘
//! ```
//!
//! Propagation is downstream only: cancelling the derived token leaves every
//! source untouched.

use std::sync::{Arc, Mutex};

use crate::lifecycle::cancellation::{CancellationToken, ListenerHandle};

struct Link {
    label: &'static str,
    source: CancellationToken,
    handle: Option<ListenerHandle>,
}

/// An ordered set of source tokens feeding one derived token.
pub struct CancellationChain {
    derived: CancellationToken,
    links: Vec<Link>,
    first: Arc<Mutex<Option<&'static str>>>,
}

impl CancellationChain {
    /// A chain with no sources yet; its token can still be cancelled directly.
    pub fn new() -> Self {
        Self {
            derived: CancellationToken::new(),
            links: Vec::new(),
            first: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a chain whose token fires when any of `sources` fires.
    pub fn derive<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'a CancellationToken)>,
    {
        let mut chain = Self::new();
        for (label, source) in sources {
            chain.link(label, source);
        }
        chain
    }

    /// Add `source` to the chain.
    ///
    /// An already-cancelled source cancels the derived token immediately.
    pub fn link(&mut self, label: &'static str, source: &CancellationToken) {
        let derived = self.derived.clone();
        let first = self.first.clone();
        let handle = source.on_cancel(move |reason| {
            if derived.cancel_with(reason.clone()) {
                if let Ok(mut first) = first.lock() {
                    *first = Some(label);
                }
                tracing::debug!(source = label, reason = %reason, "Cancellation propagated");
            }
        });
        self.links.push(Link {
            label,
            source: source.clone(),
            handle: Some(handle),
        });
    }

    /// The derived token.
    pub fn token(&self) -> &CancellationToken {
        &self.derived
    }

    /// Whether the source registered under `label` has been cancelled.
    pub fn is_source_cancelled(&self, label: &str) -> bool {
        self.links
            .iter()
            .any(|link| link.label == label && link.source.is_cancelled())
    }

    /// Label of the source whose cancellation reached the derived token.
    ///
    /// `None` if no source fired or the derived token was cancelled directly.
    pub fn fired_first(&self) -> Option<&'static str> {
        self.first.lock().ok().and_then(|first| *first)
    }

    /// Remove every listener the chain attached to its sources.
    pub fn detach_all(&mut self) {
        for link in &mut self.links {
            if let Some(handle) = link.handle.take() {
                handle.detach();
            }
        }
    }
}

impl Default for CancellationChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationChain {
    fn drop(&mut self) {
        self.detach_all();
    }
}
