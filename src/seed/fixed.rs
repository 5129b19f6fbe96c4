//! Static seeds: a snapshot of the providers live when the value is requested.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::Context;
use crate::error::ContextError;
use crate::provider::Provider;
use crate::seed::{SeedKind, Seeder};

/// Seed kind of non-updatable keys.
pub struct Fixed<T>(PhantomData<fn() -> T>);

/// Providers of one seed key, evaluated lazily against a context.
pub struct FixedSeed<T> {
    context: Context,
    providers: Arc<Vec<Provider<T>>>,
}

impl<T> Clone for FixedSeed<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            providers: self.providers.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FixedSeed<T> {
    pub fn providers(&self) -> &[Provider<T>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The most recently registered non-empty contribution.
    ///
    /// Providers are invoked from the most recent backwards and only until one contributes.
    pub fn last(&self) -> Result<Option<T>, ContextError> {
        for provider in self.providers.iter().rev() {
            if let Some(value) = provider.provide(&self.context)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Every non-empty contribution, in registration order
    pub fn all(&self) -> Result<Vec<T>, ContextError> {
        let mut values = Vec::with_capacity(self.providers.len());
        for provider in self.providers.iter() {
            if let Some(value) = provider.provide(&self.context)? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

impl<T: Clone + Send + Sync + 'static> SeedKind for Fixed<T> {
    type Asset = Provider<T>;
    type Seed = FixedSeed<T>;

    fn seed(context: &Context, seeder: &Seeder<Self::Asset>) -> Self::Seed {
        let providers = seeder
            .snapshot()
            .iter()
            .map(|registration| registration.asset.clone())
            .collect();
        FixedSeed {
            context: context.clone(),
            providers: Arc::new(providers),
        }
    }

    fn combine(context: &Context, first: Self::Seed, second: Self::Seed) -> Self::Seed {
        if second.is_empty() {
            return first;
        }
        if first.is_empty() {
            return second;
        }
        let providers = first
            .providers
            .iter()
            .chain(second.providers.iter())
            .cloned()
            .collect();
        FixedSeed {
            context: context.clone(),
            providers: Arc::new(providers),
        }
    }

    fn is_empty(seed: &Self::Seed) -> bool {
        seed.is_empty()
    }
}
