use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::context::WeakContext;
use crate::error::ContextError;
use crate::key::{ContextKey, KeyId, SeedKey};
use crate::lease::Lease;
use crate::provider::Provider;
use crate::seed::Updatable;
use crate::slot::ValueSlot;
use crate::stream::{StreamEvent, ValueStream};

/// Updatable key whose stream carries the most recent contribution.
pub struct UpdatableKey<T> {
    id: KeyId,
    name: Arc<str>,
    seed_key: SeedKey<Updatable<T>>,
    default: Option<Provider<T>>,
}

/// Updatable key whose stream carries every contribution, in registration order.
pub struct UpdatableMultiKey<T> {
    id: KeyId,
    name: Arc<str>,
    seed_key: SeedKey<Updatable<T>>,
    default: Option<Provider<Vec<T>>>,
}

macro_rules! updatable_key_common {
    ($key:ident, $default:ty) => {
        impl<T: Clone + Send + Sync + 'static> $key<T> {
            pub fn new(name: impl Into<Arc<str>>) -> Self {
                let name = name.into();
                Self {
                    id: KeyId::next(),
                    seed_key: SeedKey::new(name.clone()),
                    name,
                    default: None,
                }
            }

            /// Provider consulted whenever there are no contributions and the caller gave
            /// no fallback
            pub fn with_default(mut self, default: impl Into<Provider<$default>>) -> Self {
                self.default = Some(default.into());
                self
            }

            /// Grow from a shared pool of registrations
            pub fn with_seed_key(mut self, seed_key: SeedKey<Updatable<T>>) -> Self {
                self.seed_key = seed_key;
                self
            }
        }

        impl<T> Clone for $key<T> {
            fn clone(&self) -> Self {
                Self {
                    id: self.id,
                    name: self.name.clone(),
                    seed_key: self.seed_key.clone(),
                    default: self.default.clone(),
                }
            }
        }

        impl<T> fmt::Display for $key<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.name)
            }
        }

        impl<T> fmt::Debug for $key<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($key))
                    .field("id", &self.id)
                    .field("name", &self.name)
                    .finish()
            }
        }
    };
}

updatable_key_common!(UpdatableKey, T);
updatable_key_common!(UpdatableMultiKey, Vec<T>);

impl<T: Clone + Send + Sync + 'static> ContextKey for UpdatableKey<T> {
    type Value = ValueStream<T>;
    type Kind = Updatable<T>;

    fn id(&self) -> KeyId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seed_key(&self) -> &SeedKey<Updatable<T>> {
        &self.seed_key
    }

    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError> {
        grow_stream(slot, self.default.clone(), |values: &[T]| values.last().cloned())
    }
}

impl<T: Clone + Send + Sync + 'static> ContextKey for UpdatableMultiKey<T> {
    type Value = ValueStream<Vec<T>>;
    type Kind = Updatable<T>;

    fn id(&self) -> KeyId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seed_key(&self) -> &SeedKey<Updatable<T>> {
        &self.seed_key
    }

    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError> {
        let default = self
            .default
            .clone()
            .unwrap_or_else(|| Provider::new(|_| Ok(Some(Vec::new()))));
        grow_stream(slot, Some(default), |values: &[T]| {
            (!values.is_empty()).then(|| values.to_vec())
        })
    }
}

/// What the output follows while the seed has no contributions.
enum Absent<V> {
    /// Forward the caller's fallback stream
    Forward(ValueStream<V>),
    /// The caller asked for no value: end with a missing-value failure
    Refuse,
    /// Consult the key's default, if any
    Default(Option<Provider<V>>),
}

/// Shared growth of updatable flavors: re-derive the value on every seed emission.
fn grow_stream<K, T, V>(
    slot: &mut ValueSlot<'_, K>,
    default: Option<Provider<V>>,
    pick: impl Fn(&[T]) -> Option<V> + Send + Sync + 'static,
) -> Result<(), ContextError>
where
    K: ContextKey<Kind = Updatable<T>, Value = ValueStream<V>>,
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let absent = if slot.has_fallback() {
        match slot.fallback() {
            Some(stream) => Absent::Forward(stream),
            None => Absent::Refuse,
        }
    } else {
        Absent::Default(default)
    };

    let output = ValueStream::new();
    output.bind(slot.context().lease());

    let follower = Follower {
        name: Arc::from(slot.key().name()),
        context: slot.context().downgrade(),
        output: output.clone(),
        absent,
        forwarding: Mutex::new(None),
        on_default: AtomicBool::new(false),
    };
    let follower = Arc::new(follower);

    let observer = follower.clone();
    let subscription = slot.seed().stream().subscribe(move |event| match event {
        StreamEvent::Value(values) => match pick(values) {
            Some(value) => observer.present(value),
            None => observer.absent(),
        },
        StreamEvent::End(reason) => {
            observer.output.end(reason.clone());
        }
    });

    output.subscribe(move |event| {
        if let StreamEvent::End(_) = event {
            subscription.off();
            follower.stop_forwarding();
        }
    });

    slot.insert(output);
    Ok(())
}

struct Follower<V> {
    name: Arc<str>,
    context: WeakContext,
    output: ValueStream<V>,
    absent: Absent<V>,
    forwarding: Mutex<Option<Lease>>,
    /// The output carries the key's default
    on_default: AtomicBool,
}

impl<V: Clone + Send + Sync + 'static> Follower<V> {
    fn present(&self, value: V) {
        self.on_default.store(false, Ordering::Release);
        self.stop_forwarding();
        self.output.send(value);
    }

    fn absent(&self) {
        match &self.absent {
            Absent::Forward(fallback) => self.forward(fallback),
            Absent::Refuse => {
                self.output.end(Some(ContextError::missing(&self.name)));
            }
            Absent::Default(default) => {
                if self.on_default.swap(true, Ordering::AcqRel) {
                    return;
                }
                let Some(context) = self.context.upgrade() else {
                    self.output.end(Some(ContextError::ContextDestroyed));
                    return;
                };
                let provided = match default {
                    Some(default) => default.provide(&context),
                    None => Ok(None),
                };
                match provided {
                    Ok(Some(value)) => {
                        self.output.send(value);
                    }
                    Ok(None) => {
                        debug!(key = %self.name, "updatable key lost its last contribution");
                        self.output.end(Some(ContextError::missing(&self.name)));
                    }
                    Err(err) => {
                        self.output.end(Some(err));
                    }
                }
            }
        }
    }

    fn forward(&self, fallback: &ValueStream<V>) {
        if self.forwarding.lock().is_some() {
            return;
        }
        let output = self.output.clone();
        let subscription = fallback.subscribe(move |event| match event {
            StreamEvent::Value(value) => {
                output.send(value.clone());
            }
            StreamEvent::End(reason) => {
                output.end(reason.clone());
            }
        });

        let mut forwarding = self.forwarding.lock();
        if forwarding.is_none() && !subscription.is_off() {
            *forwarding = Some(subscription);
        } else {
            drop(forwarding);
            subscription.off();
        }
    }

    fn stop_forwarding(&self) {
        let forwarding = self.forwarding.lock().take();
        if let Some(subscription) = forwarding {
            subscription.off();
        }
    }
}
