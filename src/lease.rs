//! Leases
//!
//! A lease is a cancellation token with an optional failure reason. Every registration,
//! module use and asynchronous loading chain is anchored to one. Cutting a lease off is
//! synchronous: callbacks run on the caller's stack, and leases declared to need it are
//! cut off with the same reason before `cut_off` returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::ContextError;

type OffCallback = Box<dyn FnOnce(Option<ContextError>) + Send>;

static LEASE_COUNTER: AtomicU64 = AtomicU64::new(1);

enum LeaseState {
    Active {
        callbacks: Vec<(u64, OffCallback)>,
        next_callback: u64,
    },
    Off(Option<ContextError>),
}

struct LeaseInner {
    id: u64,
    state: Mutex<LeaseState>,
}

/// Cancellation token with an optional failure reason.
///
/// Cloning a lease yields another handle to the same token.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Create a new active lease
    pub fn new() -> Self {
        Self::with_state(LeaseState::Active {
            callbacks: Vec::new(),
            next_callback: 0,
        })
    }

    /// Create a lease that is already cut off with the given reason
    pub fn cut(reason: Option<ContextError>) -> Self {
        Self::with_state(LeaseState::Off(reason))
    }

    fn with_state(state: LeaseState) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                id: LEASE_COUNTER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(state),
            }),
        }
    }

    /// Process-unique lease identifier, for diagnostics
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this lease has been cut off
    pub fn is_off(&self) -> bool {
        matches!(*self.inner.state.lock(), LeaseState::Off(_))
    }

    /// Failure reason, if the lease was cut off with one
    pub fn reason(&self) -> Option<ContextError> {
        match &*self.inner.state.lock() {
            LeaseState::Off(reason) => reason.clone(),
            LeaseState::Active { .. } => None,
        }
    }

    /// Cut this lease off without a failure reason
    pub fn off(&self) -> bool {
        self.cut_off(None)
    }

    /// Cut this lease off because of `reason`
    pub fn fail(&self, reason: ContextError) -> bool {
        self.cut_off(Some(reason))
    }

    /// Cut this lease off.
    ///
    /// Returns `false` if it was already off; the original reason is kept then.
    pub fn cut_off(&self, reason: Option<ContextError>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                LeaseState::Off(_) => return false,
                LeaseState::Active { callbacks, .. } => {
                    let callbacks = std::mem::take(callbacks);
                    *state = LeaseState::Off(reason.clone());
                    callbacks
                }
            }
        };

        trace!(lease = self.inner.id, failed = reason.is_some(), "lease cut off");
        for (_, callback) in callbacks {
            callback(reason.clone());
        }
        true
    }

    /// Run `callback` once this lease is cut off.
    ///
    /// Runs immediately when the lease is already off.
    pub fn when_off(&self, callback: impl FnOnce(Option<ContextError>) + Send + 'static) {
        self.register(Box::new(callback));
    }

    /// Make this lease end when `other` ends, with the same reason.
    ///
    /// `other` keeps this lease alive until either of them ends, so the returned handle
    /// may be dropped.
    pub fn needs(&self, other: &Lease) -> &Self {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return self;
        }

        let dependant = self.clone();
        let registration = other.register(Box::new(move |reason| {
            dependant.cut_off(reason);
        }));

        if let Some(id) = registration {
            let dependency: Weak<LeaseInner> = Arc::downgrade(&other.inner);
            self.register(Box::new(move |_| {
                if let Some(inner) = dependency.upgrade() {
                    Lease { inner }.forget(id);
                }
            }));
        }
        self
    }

    /// Create a new lease that ends when this one does
    pub fn derive(&self) -> Lease {
        let derived = Lease::new();
        derived.needs(self);
        derived
    }

    /// Wait until this lease is cut off and return the reason it was cut off with.
    ///
    /// Dropping the future before the lease ends unregisters its callback.
    pub async fn ended(&self) -> Option<ContextError> {
        let (tx, rx) = oneshot::channel();
        let registration = self.register(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));
        let _waiter = registration.map(|id| Waiter {
            lease: Arc::downgrade(&self.inner),
            id,
        });
        rx.await.unwrap_or(None)
    }

    fn register(&self, callback: OffCallback) -> Option<u64> {
        let reason = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                LeaseState::Active {
                    callbacks,
                    next_callback,
                } => {
                    let id = *next_callback;
                    *next_callback += 1;
                    callbacks.push((id, callback));
                    return Some(id);
                }
                LeaseState::Off(reason) => reason.clone(),
            }
        };
        callback(reason);
        None
    }

    fn forget(&self, id: u64) {
        if let LeaseState::Active { callbacks, .. } = &mut *self.inner.state.lock() {
            callbacks.retain(|(callback_id, _)| *callback_id != id);
        }
    }

    #[cfg(test)]
    fn pending_callbacks(&self) -> usize {
        match &*self.inner.state.lock() {
            LeaseState::Active { callbacks, .. } => callbacks.len(),
            LeaseState::Off(_) => 0,
        }
    }
}

/// Pending `ended` callback, forgotten when the waiting future is dropped.
struct Waiter {
    lease: Weak<LeaseInner>,
    id: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(inner) = self.lease.upgrade() {
            Lease { inner }.forget(self.id);
        }
    }
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Lease {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Lease {}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            LeaseState::Active { .. } => "active".to_string(),
            LeaseState::Off(None) => "off".to_string(),
            LeaseState::Off(Some(reason)) => format!("failed: {}", reason),
        };
        f.debug_struct("Lease")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}
