//! Providers
//!
//! Application code registers assets in one of several shapes ([`ProviderSpec`]): a
//! constant, an alias of another key, a function of the context, a function of declared
//! dependency values, or a type constructed from the context. Every shape normalises to a
//! single [`Provider`] function before it reaches a seeder.
//!
//! Updatable keys register [`UpdatableProvider`]s instead, whose contributions may be a
//! nested [`ValueStream`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::error::ContextError;
use crate::key::ContextKey;
use crate::stream::ValueStream;

type ProviderFn<T> = dyn Fn(&Context) -> Result<Option<T>, ContextError> + Send + Sync;

/// Normalised provider function: yields one contribution, or none.
pub struct Provider<T> {
    provide: Arc<ProviderFn<T>>,
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            provide: self.provide.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Provider<T> {
    /// Wrap a fallible provider function
    pub fn new(
        provide: impl Fn(&Context) -> Result<Option<T>, ContextError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            provide: Arc::new(provide),
        }
    }

    /// Invoke the provider against `context`
    pub fn provide(&self, context: &Context) -> Result<Option<T>, ContextError> {
        (self.provide)(context)
    }

    /// Whether both handles wrap the same function object
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.provide, &other.provide)
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Provider")
    }
}

/// A type that can be constructed from context values.
pub trait FromContext: Sized {
    fn from_context(context: &Context) -> Result<Self, ContextError>;
}

/// Declared value dependencies of a provider.
///
/// Implemented for tuples of one to four keys.
pub trait Dependencies: Send + Sync + 'static {
    type Values;

    fn resolve(&self, context: &Context) -> Result<Self::Values, ContextError>;
}

macro_rules! tuple_dependencies {
    ($($key:ident),+) => {
        impl<$($key),+> Dependencies for ($($key,)+)
        where
            $($key: ContextKey,)+
        {
            type Values = ($($key::Value,)+);

            #[allow(non_snake_case)]
            fn resolve(&self, context: &Context) -> Result<Self::Values, ContextError> {
                let ($($key,)+) = self;
                Ok(($(context.get($key)?,)+))
            }
        }
    };
}

tuple_dependencies!(A);
tuple_dependencies!(A, B);
tuple_dependencies!(A, B, C);
tuple_dependencies!(A, B, C, D);

/// Asset specifier accepted by [`crate::Registry::provide`].
pub enum ProviderSpec<T> {
    /// A constant contribution
    Value(T),
    /// The value of another key; contributes nothing when that key has no value
    Alias(Arc<ProviderFn<T>>),
    /// A function of the context
    By(Arc<dyn Fn(&Context) -> Option<T> + Send + Sync>),
    /// A function of declared dependency values
    ByDeps(Arc<ProviderFn<T>>),
    /// A value constructed from the context
    Construct(fn(&Context) -> Result<T, ContextError>),
}

impl<T: Clone + Send + Sync + 'static> ProviderSpec<T> {
    pub fn value(value: T) -> Self {
        ProviderSpec::Value(value)
    }

    pub fn alias<K>(key: K) -> Self
    where
        K: ContextKey<Value = T>,
    {
        ProviderSpec::Alias(Arc::new(move |context: &Context| match context.get(&key) {
            Ok(value) => Ok(Some(value)),
            Err(ContextError::MissingValue { key: missing }) => {
                debug!(alias_of = %missing, "aliased key has no value");
                Ok(None)
            }
            Err(err) => Err(err),
        }))
    }

    pub fn by(provide: impl Fn(&Context) -> Option<T> + Send + Sync + 'static) -> Self {
        ProviderSpec::By(Arc::new(provide))
    }

    pub fn by_deps<D>(deps: D, provide: impl Fn(D::Values) -> Option<T> + Send + Sync + 'static) -> Self
    where
        D: Dependencies,
    {
        ProviderSpec::ByDeps(Arc::new(move |context: &Context| {
            let values = deps.resolve(context)?;
            Ok(provide(values))
        }))
    }

    pub fn construct() -> Self
    where
        T: FromContext,
    {
        ProviderSpec::Construct(T::from_context)
    }

    /// Normalise into a provider function
    pub fn into_provider(self) -> Provider<T> {
        match self {
            ProviderSpec::Value(value) => Provider::new(move |_| Ok(Some(value.clone()))),
            ProviderSpec::Alias(provide) | ProviderSpec::ByDeps(provide) => Provider { provide },
            ProviderSpec::By(provide) => Provider::new(move |context| Ok(provide(context))),
            ProviderSpec::Construct(construct) => {
                Provider::new(move |context| construct(context).map(Some))
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> From<ProviderSpec<T>> for Provider<T> {
    fn from(spec: ProviderSpec<T>) -> Self {
        spec.into_provider()
    }
}

/// Contribution of an updatable provider.
#[derive(Clone)]
pub enum UpdateSource<T> {
    /// A single, fixed value
    Value(T),
    /// A nested stream of values; its end withdraws the contribution
    Stream(ValueStream<Vec<T>>),
}

type UpdatableFn<T> = dyn Fn(&Context) -> Result<Option<UpdateSource<T>>, ContextError> + Send + Sync;

/// Provider of an updatable key.
pub struct UpdatableProvider<T> {
    provide: Arc<UpdatableFn<T>>,
}

impl<T> Clone for UpdatableProvider<T> {
    fn clone(&self) -> Self {
        Self {
            provide: self.provide.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> UpdatableProvider<T> {
    pub fn new(
        provide: impl Fn(&Context) -> Result<Option<UpdateSource<T>>, ContextError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            provide: Arc::new(provide),
        }
    }

    /// A constant contribution
    pub fn value(value: T) -> Self {
        Self::new(move |_| Ok(Some(UpdateSource::Value(value.clone()))))
    }

    /// Contribute everything `stream` emits
    pub fn stream(stream: ValueStream<Vec<T>>) -> Self {
        Self::new(move |_| Ok(Some(UpdateSource::Stream(stream.clone()))))
    }

    pub fn provide(&self, context: &Context) -> Result<Option<UpdateSource<T>>, ContextError> {
        (self.provide)(context)
    }
}

impl<T: Clone + Send + Sync + 'static> From<ProviderSpec<T>> for UpdatableProvider<T> {
    fn from(spec: ProviderSpec<T>) -> Self {
        let provider = spec.into_provider();
        Self::new(move |context| Ok(provider.provide(context)?.map(UpdateSource::Value)))
    }
}

impl<T: Clone + Send + Sync + 'static> From<ValueStream<Vec<T>>> for UpdatableProvider<T> {
    fn from(stream: ValueStream<Vec<T>>) -> Self {
        Self::stream(stream)
    }
}

impl<T> fmt::Debug for UpdatableProvider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdatableProvider")
    }
}
