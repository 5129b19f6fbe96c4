//! Registries
//!
//! A registry owns one [`Seeder`] per seed key. Producers register assets with
//! [`Registry::provide`]; consumers create contexts with [`Registry::new_values`] and read
//! values from them. Registries can be chained with [`Registry::append`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ModuleSettings;
use crate::context::Context;
use crate::key::{ContextKey, KeyId, SeedKey};
use crate::lease::Lease;
use crate::module::{Module, ModuleImpl};
use crate::provider::UpdatableProvider;
use crate::seed::{SeedKind, Seeder};

struct RegistryInner {
    seeders: Mutex<HashMap<KeyId, Arc<dyn Any + Send + Sync>>>,
    /// Registries whose seeds precede this registry's own, in order
    chain: Vec<Registry>,
    settings: ModuleSettings,
}

/// Owner of per-key seeders; factory of contexts.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create an empty registry with default module settings
    pub fn new() -> Self {
        Self::with_settings(ModuleSettings::default())
    }

    /// Create an empty registry with the given module settings
    pub fn with_settings(settings: ModuleSettings) -> Self {
        Self::build(Vec::new(), settings)
    }

    fn build(chain: Vec<Registry>, settings: ModuleSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                seeders: Mutex::new(HashMap::new()),
                chain,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.inner.settings
    }

    /// Register an asset for `key`. Cutting off the returned lease withdraws it.
    pub fn provide<K: ContextKey>(
        &self,
        key: &K,
        asset: impl Into<<K::Kind as SeedKind>::Asset>,
    ) -> Lease {
        debug!(key = key.name(), seed_key = key.seed_key().name(), "providing asset");
        self.seeder(key.seed_key()).provide(asset.into())
    }

    /// Provide `module`, and a replacement for every module it declares to have.
    ///
    /// Cutting off the returned lease withdraws all of them.
    pub fn provide_module(&self, module: &Module) -> Lease {
        let lease = Lease::new();
        for target in module.has() {
            let implementation = ModuleImpl::of(&target, module);
            self.provide(&target, UpdatableProvider::value(implementation))
                .needs(&lease);
        }
        info!(module = %module, "module provided");
        lease
    }

    /// Seeder of `seed_key`, created on first request
    pub fn seeder<S: SeedKind>(&self, seed_key: &SeedKey<S>) -> Arc<Seeder<S::Asset>> {
        let mut seeders = self.inner.seeders.lock();
        if let Some(existing) = seeders.get(&seed_key.id()) {
            if let Ok(seeder) = existing.clone().downcast::<Seeder<S::Asset>>() {
                return seeder;
            }
        }
        let seeder = Arc::new(Seeder::<S::Asset>::new());
        seeders.insert(seed_key.id(), seeder.clone());
        seeder
    }

    /// Seed of `seed_key` for `context`: chained registries first, then this one.
    pub fn seed_in<S: SeedKind>(&self, context: &Context, seed_key: &SeedKey<S>) -> S::Seed {
        let own = S::seed(context, &self.seeder(seed_key));
        let chained = self
            .inner
            .chain
            .iter()
            .map(|registry| registry.seed_in(context, seed_key))
            .reduce(|first, second| S::combine(context, first, second));
        match chained {
            Some(chained) => S::combine(context, chained, own),
            None => own,
        }
    }

    /// Chain `other` after this registry.
    ///
    /// Seeds of the new registry combine this registry's seed, then `other`'s, then its
    /// own registrations.
    pub fn append(&self, other: &Registry) -> Registry {
        Self::build(vec![self.clone(), other.clone()], self.inner.settings.clone())
    }

    /// Create a new context reading from this registry
    pub fn new_values(&self) -> Context {
        Context::new(self.clone())
    }

    /// Whether both handles refer to the same registry
    pub fn same_as(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("seeders", &self.inner.seeders.lock().len())
            .field("chained", &self.inner.chain.len())
            .finish()
    }
}
