//! Value keys
//!
//! A key identifies one requestable value. Keys compare by identity: every constructed key
//! gets a fresh [`KeyId`], so two keys with the same name are still different keys.
//! Each key points at a [`SeedKey`] naming the pool of registrations it grows from;
//! several keys may share one seed key.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::error::ContextError;
use crate::registry::Registry;
use crate::seed::SeedKind;
use crate::slot::ValueSlot;

/// Process-unique key identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

impl KeyId {
    /// Allocate the next key identity
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        KeyId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A requestable value.
///
/// Implementations pick the seed kind they grow from and decide in [`ContextKey::grow`]
/// how the seed turns into a value.
pub trait ContextKey: Send + Sync + 'static {
    /// Value type stored in the context cache
    type Value: Clone + Send + Sync + 'static;
    /// Kind of seed this key grows from
    type Kind: SeedKind;

    /// Identity of this key
    fn id(&self) -> KeyId;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Seed key whose registrations this key grows from
    fn seed_key(&self) -> &SeedKey<Self::Kind>;

    /// Grow a value out of the slot's seed by calling [`ValueSlot::insert`], or leave the
    /// slot empty when there is nothing to grow.
    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError>
    where
        Self: Sized;
}

/// Identity of a registration pool.
pub struct SeedKey<K> {
    id: KeyId,
    name: Arc<str>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> SeedKey<K> {
    /// Create a new, distinct seed key
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: KeyId::next(),
            name: name.into(),
            _kind: PhantomData,
        }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K> Clone for SeedKey<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> PartialEq for SeedKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for SeedKey<K> {}

impl<K> fmt::Debug for SeedKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Arguments of a key setup hook registered with [`ValueSlot::setup`].
pub struct KeySetup<'a, K> {
    pub key: &'a K,
    pub context: &'a Context,
    pub registry: &'a Registry,
}
