use std::fmt;
use std::sync::Arc;

use crate::error::ContextError;
use crate::key::{ContextKey, KeyId, SeedKey};
use crate::provider::Provider;
use crate::seed::Fixed;
use crate::slot::ValueSlot;

/// Key whose value is the most recently registered non-empty contribution.
pub struct SingleKey<T> {
    id: KeyId,
    name: Arc<str>,
    seed_key: SeedKey<Fixed<T>>,
    default: Option<Provider<T>>,
}

impl<T: Clone + Send + Sync + 'static> SingleKey<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            id: KeyId::next(),
            seed_key: SeedKey::new(name.clone()),
            name,
            default: None,
        }
    }

    /// Provider consulted when nothing was contributed and the caller gave no fallback
    pub fn with_default(mut self, default: impl Into<Provider<T>>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Grow from a shared pool of registrations
    pub fn with_seed_key(mut self, seed_key: SeedKey<Fixed<T>>) -> Self {
        self.seed_key = seed_key;
        self
    }
}

impl<T> Clone for SingleKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            seed_key: self.seed_key.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ContextKey for SingleKey<T> {
    type Value = T;
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
        if let Some(value) = slot.seed().last()? {
            slot.insert(value);
            return Ok(());
        }
        if slot.has_fallback() {
            return Ok(());
        }
        if let Some(default) = &self.default {
            if let Some(value) = default.provide(slot.context())? {
                slot.insert(value);
            }
        }
        Ok(())
    }
}

impl<T> fmt::Display for SingleKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<T> fmt::Debug for SingleKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
