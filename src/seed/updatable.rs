//! Updatable seeds: a live, flattened stream of every contribution.
//!
//! The seed follows the seeder's registrations. Each provider is invoked once per context
//! when it is registered; a nested stream it returns is followed until it ends or the
//! registration is withdrawn. Every change re-emits the complete list, and a change of
//! registrations is delivered as a single emission.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::context::{Context, WeakContext};
use crate::lease::Lease;
use crate::provider::{UpdatableProvider, UpdateSource};
use crate::seed::{Registrations, SeedKind, Seeder};
use crate::stream::{StreamEvent, ValueStream};

/// Seed kind of updatable keys.
pub struct Updatable<T>(PhantomData<fn() -> T>);

/// Live stream of every current contribution, in registration order.
pub struct UpdatableSeed<T> {
    stream: ValueStream<Vec<T>>,
}

impl<T> Clone for UpdatableSeed<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> UpdatableSeed<T> {
    pub fn stream(&self) -> &ValueStream<Vec<T>> {
        &self.stream
    }

    /// Contributions at this moment
    pub fn current(&self) -> Vec<T> {
        self.stream.current().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.current().map_or(true, |values| values.is_empty())
    }
}

struct Entry<T> {
    id: u64,
    values: Vec<T>,
    subscription: Option<Lease>,
}

/// Follows one seeder for one context.
struct Combiner<T> {
    context: WeakContext,
    entries: Mutex<Vec<Entry<T>>>,
    batching: AtomicUsize,
    output: ValueStream<Vec<T>>,
}

impl<T: Clone + Send + Sync + 'static> Combiner<T> {
    fn update(self: &Arc<Self>, registrations: &Registrations<UpdatableProvider<T>>) {
        self.batching.fetch_add(1, Ordering::AcqRel);

        let (added, removed) = {
            let mut entries = self.entries.lock();
            let mut previous = std::mem::take(&mut *entries);
            let mut added = Vec::new();
            for registration in registrations.iter() {
                match previous.iter().position(|entry| entry.id == registration.id) {
                    Some(pos) => entries.push(previous.remove(pos)),
                    None => {
                        entries.push(Entry {
                            id: registration.id,
                            values: Vec::new(),
                            subscription: None,
                        });
                        added.push(registration.clone());
                    }
                }
            }
            (added, previous)
        };

        for entry in removed {
            if let Some(subscription) = entry.subscription {
                subscription.off();
            }
        }

        if let Some(context) = self.context.upgrade() {
            for registration in added {
                match registration.asset.provide(&context) {
                    Ok(None) => {}
                    Ok(Some(UpdateSource::Value(value))) => self.set(registration.id, vec![value]),
                    Ok(Some(UpdateSource::Stream(stream))) => self.follow(registration.id, &stream),
                    Err(err) => {
                        warn!(error = %err, "updatable provider failed");
                        self.batching.fetch_sub(1, Ordering::AcqRel);
                        self.output.end(Some(err));
                        return;
                    }
                }
            }
        }

        self.batching.fetch_sub(1, Ordering::AcqRel);
        self.emit();
    }

    fn follow(self: &Arc<Self>, id: u64, stream: &ValueStream<Vec<T>>) {
        let combiner: Weak<Self> = Arc::downgrade(self);
        let subscription = stream.subscribe(move |event| {
            let Some(combiner) = combiner.upgrade() else {
                return;
            };
            match event {
                StreamEvent::Value(values) => combiner.set(id, values.clone()),
                StreamEvent::End(_) => combiner.set(id, Vec::new()),
            }
            combiner.emit();
        });

        let attached = match self.entries.lock().iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.subscription = Some(subscription.clone());
                true
            }
            None => false,
        };
        if !attached {
            subscription.off();
        }
    }

    fn set(&self, id: u64, values: Vec<T>) {
        if let Some(entry) = self.entries.lock().iter_mut().find(|entry| entry.id == id) {
            entry.values = values;
        }
    }

    fn emit(&self) {
        if self.batching.load(Ordering::Acquire) > 0 {
            return;
        }
        let values: Vec<T> = self
            .entries
            .lock()
            .iter()
            .flat_map(|entry| entry.values.iter().cloned())
            .collect();
        self.output.send(values);
    }

    fn release(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for entry in entries {
            if let Some(subscription) = entry.subscription {
                subscription.off();
            }
        }
    }
}

struct Pair<T> {
    first: Vec<T>,
    second: Vec<T>,
    primed: bool,
}

impl<T: Clone + Send + Sync + 'static> SeedKind for Updatable<T> {
    type Asset = UpdatableProvider<T>;
    type Seed = UpdatableSeed<T>;

    fn seed(context: &Context, seeder: &Seeder<Self::Asset>) -> Self::Seed {
        let output = ValueStream::new();
        let combiner = Arc::new(Combiner {
            context: context.downgrade(),
            entries: Mutex::new(Vec::new()),
            batching: AtomicUsize::new(0),
            output: output.clone(),
        });

        let follower = combiner.clone();
        let subscription = seeder.registrations().subscribe(move |event| match event {
            StreamEvent::Value(registrations) => follower.update(registrations),
            StreamEvent::End(reason) => {
                follower.output.end(reason.clone());
            }
        });

        output.bind(context.lease());
        output.subscribe(move |event| {
            if let StreamEvent::End(_) = event {
                subscription.off();
                combiner.release();
            }
        });

        UpdatableSeed { stream: output }
    }

    fn combine(context: &Context, first: Self::Seed, second: Self::Seed) -> Self::Seed {
        let output = ValueStream::new();
        let pair = Arc::new(Mutex::new(Pair {
            first: Vec::new(),
            second: Vec::new(),
            primed: false,
        }));

        let emit = {
            let pair = pair.clone();
            let output = output.clone();
            move || {
                let values = {
                    let pair = pair.lock();
                    if !pair.primed {
                        return;
                    }
                    pair.first.iter().chain(pair.second.iter()).cloned().collect::<Vec<_>>()
                };
                output.send(values);
            }
        };
        let emit = Arc::new(emit);

        let follow = |source: &UpdatableSeed<T>, is_first: bool| {
            let pair = pair.clone();
            let emit = emit.clone();
            let output = output.clone();
            source.stream.subscribe(move |event| match event {
                StreamEvent::Value(values) => {
                    {
                        let mut pair = pair.lock();
                        if is_first {
                            pair.first = values.clone();
                        } else {
                            pair.second = values.clone();
                        }
                    }
                    emit();
                }
                StreamEvent::End(reason) => {
                    output.end(reason.clone());
                }
            })
        };

        let first_subscription = follow(&first, true);
        let second_subscription = follow(&second, false);
        pair.lock().primed = true;
        emit();

        output.bind(context.lease());
        output.subscribe(move |event| {
            if let StreamEvent::End(_) = event {
                first_subscription.off();
                second_subscription.off();
            }
        });

        UpdatableSeed { stream: output }
    }

    fn is_empty(seed: &Self::Seed) -> bool {
        seed.is_empty()
    }
}
