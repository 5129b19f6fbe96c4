//! Contexts
//!
//! A [`Context`] is one instantiation of a registry's values: a per-instance cache plus the
//! resolver that grows missing values out of the registry's seeds. A grown value is cached
//! for the life of the context; withdrawing the providers it was grown from does not
//! retract it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ModuleSettings;
use crate::error::ContextError;
use crate::key::{ContextKey, KeyId, KeySetup};
use crate::lease::Lease;
use crate::registry::Registry;
use crate::slot::ValueSlot;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: u64,
    registry: Registry,
    values: Mutex<HashMap<KeyId, Arc<dyn Any + Send + Sync>>>,
    lease: Lease,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.lease.off();
    }
}

/// Per-instance value cache and resolver.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Non-owning handle to a [`Context`], used by long-lived observers.
#[derive(Clone)]
pub struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }
}

impl Context {
    pub(crate) fn new(registry: Registry) -> Self {
        let id = CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, "context created");
        Self {
            inner: Arc::new(ContextInner {
                id,
                registry,
                values: Mutex::new(HashMap::new()),
                lease: Lease::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &ModuleSettings {
        self.inner.registry.settings()
    }

    /// Lease of this context; cut off when the context is destroyed or dropped
    pub fn lease(&self) -> &Lease {
        &self.inner.lease
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same context
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Value of `key`, grown on first request.
    ///
    /// Fails with [`ContextError::MissingValue`] when nothing was grown.
    pub fn get<K: ContextKey>(&self, key: &K) -> Result<K::Value, ContextError> {
        match self.resolve(key, None)? {
            Some(value) => Ok(value),
            None => Err(ContextError::missing(key.name())),
        }
    }

    /// Value of `key`, or `fallback` when nothing was grown.
    ///
    /// Supplying a fallback (even `None`) suppresses the key's default. A fallback
    /// returned in place of a value is not cached.
    pub fn get_or<K: ContextKey>(
        &self,
        key: &K,
        fallback: Option<K::Value>,
    ) -> Result<Option<K::Value>, ContextError> {
        self.resolve(key, Some(fallback))
    }

    /// Destroy this context.
    ///
    /// Cuts its lease off with `reason`, ending every stream and module revision bound to
    /// it, and discards the cache. Later requests fail with
    /// [`ContextError::ContextDestroyed`].
    pub fn destroy(&self, reason: Option<ContextError>) {
        if self.inner.lease.cut_off(reason) {
            let values = std::mem::take(&mut *self.inner.values.lock());
            info!(context = self.inner.id, discarded = values.len(), "context destroyed");
        }
    }

    fn cached<K: ContextKey>(&self, key: &K) -> Option<K::Value> {
        self.inner
            .values
            .lock()
            .get(&key.id())
            .and_then(|value| value.downcast_ref::<K::Value>())
            .cloned()
    }

    fn resolve<K: ContextKey>(
        &self,
        key: &K,
        fallback: Option<Option<K::Value>>,
    ) -> Result<Option<K::Value>, ContextError> {
        if self.inner.lease.is_off() {
            return Err(ContextError::ContextDestroyed);
        }
        if let Some(value) = self.cached(key) {
            return Ok(Some(value));
        }

        let seed = self.inner.registry.seed_in(self, key.seed_key());
        let mut slot = ValueSlot::new(key, self, seed, fallback);
        key.grow(&mut slot)?;
        let grown = slot.into_grown();

        let value = match grown.value {
            Some(value) => value,
            None => {
                return match grown.fallback {
                    Some(fallback) => Ok(fallback),
                    None => Err(ContextError::missing(key.name())),
                }
            }
        };
        if grown.depends_on_fallback {
            debug!(key = key.name(), "value grown from fallback, not cached");
            return Ok(Some(value));
        }

        let existing = {
            let mut values = self.inner.values.lock();
            match values.get(&key.id()) {
                Some(existing) => existing.downcast_ref::<K::Value>().cloned(),
                None => {
                    values.insert(key.id(), Arc::new(value.clone()));
                    None
                }
            }
        };
        if let Some(existing) = existing {
            return Ok(Some(existing));
        }

        debug!(context = self.inner.id, key = key.name(), "value grown");
        let setup = KeySetup {
            key,
            context: self,
            registry: &self.inner.registry,
        };
        for hook in grown.setups {
            hook(&setup);
        }
        Ok(Some(value))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("values", &self.inner.values.lock().len())
            .field("destroyed", &self.inner.lease.is_off())
            .finish()
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakContext")
    }
}
