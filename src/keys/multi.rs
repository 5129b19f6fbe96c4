use std::fmt;
use std::sync::Arc;

use crate::error::ContextError;
use crate::key::{ContextKey, KeyId, SeedKey};
use crate::provider::Provider;
use crate::seed::Fixed;
use crate::slot::ValueSlot;

/// Key whose value is every non-empty contribution, in registration order.
///
/// Without contributions the value is the default sequence, which is empty unless
/// configured with [`MultiKey::with_default`].
pub struct MultiKey<T> {
    id: KeyId,
    name: Arc<str>,
    seed_key: SeedKey<Fixed<T>>,
    default: Option<Provider<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> MultiKey<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            id: KeyId::next(),
            seed_key: SeedKey::new(name.clone()),
            name,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Provider<Vec<T>>>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_seed_key(mut self, seed_key: SeedKey<Fixed<T>>) -> Self {
        self.seed_key = seed_key;
        self
    }
}

impl<T> Clone for MultiKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            seed_key: self.seed_key.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ContextKey for MultiKey<T> {
    type Value = Arc<[T]>;
    type Kind = Fixed<T>;

    fn id(&self) -> KeyId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seed_key(&self) -> &SeedKey<Fixed<T>> {
        &self.seed_key
    }

    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError> {
        let values = slot.seed().all()?;
        if !values.is_empty() {
            slot.insert(values.into());
            return Ok(());
        }
        if slot.has_fallback() {
            return Ok(());
        }
        let values = match &self.default {
            Some(default) => default.provide(slot.context())?,
            None => Some(Vec::new()),
        };
        if let Some(values) = values {
            slot.insert(values.into());
        }
        Ok(())
    }
}

impl<T> fmt::Display for MultiKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<T> fmt::Debug for MultiKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
