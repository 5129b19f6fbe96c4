//! Seeds and seeders
//!
//! A [`Seeder`] accumulates the registrations made against one seed key in one registry.
//! When a context needs a value, the seeder's registrations are turned into a *seed*: the
//! unmerged contributions a key grows its value from. How a seed is represented, combined
//! and tested for emptiness is decided by the key's [`SeedKind`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::lease::Lease;
use crate::stream::ValueStream;

mod fixed;
mod updatable;

pub use fixed::{Fixed, FixedSeed};
pub use updatable::{Updatable, UpdatableSeed};

/// Closed set of seed representations.
pub trait SeedKind: Send + Sync + 'static {
    /// Normalised asset stored by the seeder
    type Asset: Clone + Send + Sync + 'static;
    /// Per-context accumulation of contributions
    type Seed: Clone + Send + Sync + 'static;

    /// Build the seed of `seeder`'s current registrations for `context`.
    fn seed(context: &Context, seeder: &Seeder<Self::Asset>) -> Self::Seed;

    /// Concatenate two seeds, `first` contributions before `second`.
    fn combine(context: &Context, first: Self::Seed, second: Self::Seed) -> Self::Seed;

    /// Whether `seed` currently holds no contributions
    fn is_empty(seed: &Self::Seed) -> bool;
}

/// One asset registered with a seeder.
#[derive(Debug, Clone)]
pub struct Registration<A> {
    pub id: u64,
    pub asset: A,
}

/// Registrations made against one seed key, in registration order.
pub type Registrations<A> = Arc<Vec<Registration<A>>>;

/// Accumulates assets registered against one seed key.
pub struct Seeder<A> {
    registrations: ValueStream<Registrations<A>>,
    next_id: AtomicU64,
}

impl<A: Clone + Send + Sync + 'static> Seeder<A> {
    pub fn new() -> Self {
        Self {
            registrations: ValueStream::with_value(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `asset`. Cutting off the returned lease withdraws it.
    ///
    /// Registering the same asset twice creates two independent registrations.
    pub fn provide(self: &Arc<Self>, asset: A) -> Lease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.modify(|current| {
            let mut next = current.map(|list| list.as_ref().clone()).unwrap_or_default();
            next.push(Registration { id, asset });
            Arc::new(next)
        });
        trace!(registration = id, "asset registered");

        let lease = Lease::new();
        let seeder = Arc::downgrade(self);
        lease.when_off(move |_| {
            if let Some(seeder) = seeder.upgrade() {
                seeder.withdraw(id);
            }
        });
        lease
    }

    fn withdraw(&self, id: u64) {
        self.registrations.modify(|current| {
            let mut next = current.map(|list| list.as_ref().clone()).unwrap_or_default();
            next.retain(|registration| registration.id != id);
            Arc::new(next)
        });
        trace!(registration = id, "asset withdrawn");
    }

    /// Currently live registrations
    pub fn snapshot(&self) -> Registrations<A> {
        self.registrations.current().unwrap_or_default()
    }

    /// Stream of live registrations, re-emitted on every change
    pub fn registrations(&self) -> &ValueStream<Registrations<A>> {
        &self.registrations
    }
}

impl<A: Clone + Send + Sync + 'static> Default for Seeder<A> {
    fn default() -> Self {
        Self::new()
    }
}
