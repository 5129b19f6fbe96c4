//! Value slots: the working area handed to [`ContextKey::grow`] for one resolution.

use crate::context::Context;
use crate::error::ContextError;
use crate::key::{ContextKey, KeySetup};
use crate::registry::Registry;
use crate::seed::SeedKind;

pub(crate) type SetupHook<K> = Box<dyn for<'s> FnOnce(&KeySetup<'s, K>)>;

/// Seed of key `K`
pub type SeedOf<K> = <<K as ContextKey>::Kind as SeedKind>::Seed;

/// Mutable working area for growing one key's value in one context.
pub struct ValueSlot<'a, K: ContextKey> {
    key: &'a K,
    context: &'a Context,
    seed: SeedOf<K>,
    fallback: Option<Option<K::Value>>,
    fallback_read: bool,
    value: Option<K::Value>,
    setups: Vec<SetupHook<K>>,
}

/// What a growth produced.
pub(crate) struct Grown<K: ContextKey> {
    pub value: Option<K::Value>,
    pub fallback: Option<Option<K::Value>>,
    pub depends_on_fallback: bool,
    pub setups: Vec<SetupHook<K>>,
}

impl<'a, K: ContextKey> ValueSlot<'a, K> {
    pub(crate) fn new(
        key: &'a K,
        context: &'a Context,
        seed: SeedOf<K>,
        fallback: Option<Option<K::Value>>,
    ) -> Self {
        Self {
            key,
            context,
            seed,
            fallback,
            fallback_read: false,
            value: None,
            setups: Vec::new(),
        }
    }

    pub fn key(&self) -> &K {
        self.key
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    pub fn registry(&self) -> &Registry {
        self.context.registry()
    }

    /// Seed the value grows from
    pub fn seed(&self) -> &SeedOf<K> {
        &self.seed
    }

    /// Whether the caller supplied a fallback (possibly empty)
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// The caller-supplied fallback value.
    ///
    /// A value grown after reading the fallback depends on it and is not cached.
    pub fn fallback(&mut self) -> Option<K::Value> {
        self.fallback_read = true;
        self.fallback.clone().flatten()
    }

    /// Insert the grown value
    pub fn insert(&mut self, value: K::Value) {
        self.value = Some(value);
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&K::Value> {
        self.value.as_ref()
    }

    /// Register a hook to run once the value is cached in the context.
    ///
    /// Hooks run at most once per context and key, and only when the value is cached.
    pub fn setup(&mut self, hook: impl for<'s> FnOnce(&KeySetup<'s, K>) + 'static) {
        self.setups.push(Box::new(hook));
    }

    /// Run a sub-growth against this slot and read back what it inserted.
    pub fn fill_by(
        &mut self,
        grow: impl FnOnce(&mut Self) -> Result<(), ContextError>,
    ) -> Result<Option<K::Value>, ContextError> {
        grow(self)?;
        Ok(self.value.clone())
    }

    pub(crate) fn into_grown(self) -> Grown<K> {
        Grown {
            value: self.value,
            fallback: self.fallback,
            depends_on_fallback: self.fallback_read,
            setups: self.setups,
        }
    }
}
