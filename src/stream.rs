//! Value Streams
//!
//! A [`ValueStream`] holds the latest value and pushes every change to its subscribers.
//! New subscribers receive the current value ahead of any later change. A stream ends at
//! most once, optionally with a failure reason; subscribers receive the end as a terminal
//! event.
//!
//! Events are delivered on the pushing caller's stack. A push or replay made while the
//! stream is already delivering (e.g. from inside a subscriber, or from another thread) is
//! queued and delivered in order by the delivering frame, so every subscriber observes the
//! same sequence of values.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use futures::channel::mpsc;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ContextError;
use crate::lease::Lease;

/// Event delivered to stream subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent<T> {
    /// The stream's current value changed
    Value(T),
    /// The stream ended, with an optional failure reason
    End(Option<ContextError>),
}

type Observer<T> = Arc<dyn Fn(&StreamEvent<T>) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    /// Sequence number of the last event this subscriber has already seen via replay
    since: u64,
    active: Arc<AtomicBool>,
    observer: Observer<T>,
    lease: Lease,
}

/// Event waiting for delivery.
struct Queued<T> {
    seq: u64,
    event: StreamEvent<T>,
    /// Replays go to a single subscriber
    only: Option<u64>,
}

struct StreamState<T> {
    current: Option<T>,
    end: Option<Option<ContextError>>,
    seq: u64,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber: u64,
    pending: VecDeque<Queued<T>>,
    emitting: bool,
}

impl<T> StreamState<T> {
    fn enqueue(&mut self, event: StreamEvent<T>) {
        self.seq += 1;
        self.pending.push_back(Queued {
            seq: self.seq,
            event,
            only: None,
        });
    }
}

struct StreamShared<T> {
    state: Mutex<StreamState<T>>,
}

/// Subscribe-and-replay push stream of values.
pub struct ValueStream<T> {
    shared: Arc<StreamShared<T>>,
}

impl<T> Clone for ValueStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ValueStream<T> {
    /// Create a stream without a current value
    pub fn new() -> Self {
        Self::from_current(None)
    }

    /// Create a stream holding `value`
    pub fn with_value(value: T) -> Self {
        Self::from_current(Some(value))
    }

    /// Create a stream that has already ended
    pub fn ended(reason: Option<ContextError>) -> Self {
        let stream = Self::new();
        stream.end(reason);
        stream
    }

    fn from_current(current: Option<T>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                state: Mutex::new(StreamState {
                    current,
                    end: None,
                    seq: 0,
                    subscribers: Vec::new(),
                    next_subscriber: 0,
                    pending: VecDeque::new(),
                    emitting: false,
                }),
            }),
        }
    }

    /// Latest value pushed to this stream
    pub fn current(&self) -> Option<T> {
        self.shared.state.lock().current.clone()
    }

    /// Whether the stream has ended
    pub fn is_ended(&self) -> bool {
        self.shared.state.lock().end.is_some()
    }

    /// Failure reason the stream ended with, if any
    pub fn end_reason(&self) -> Option<ContextError> {
        self.shared.state.lock().end.clone().flatten()
    }

    /// Whether both handles refer to the same stream
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Push a new value. Returns `false` if the stream has already ended.
    pub fn send(&self, value: T) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.end.is_some() {
                return false;
            }
            state.current = Some(value.clone());
            state.enqueue(StreamEvent::Value(value));
        }
        self.drain();
        true
    }

    /// Update the current value in place and push the result.
    ///
    /// `update` sees `None` when the stream has no value yet.
    pub fn modify(&self, update: impl FnOnce(Option<&T>) -> T) -> bool {
        self.update(|current| Some(update(current)))
    }

    /// Like [`ValueStream::modify`], but pushes nothing when `update` returns `None`.
    ///
    /// `update` runs while the stream is locked, so concurrent updates are pushed in the
    /// order their closures ran.
    pub fn update(&self, update: impl FnOnce(Option<&T>) -> Option<T>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.end.is_some() {
                return false;
            }
            let Some(value) = update(state.current.as_ref()) else {
                return false;
            };
            state.current = Some(value.clone());
            state.enqueue(StreamEvent::Value(value));
        }
        self.drain();
        true
    }

    /// End the stream. Returns `false` if it has already ended.
    pub fn end(&self, reason: Option<ContextError>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.end.is_some() {
                return false;
            }
            state.end = Some(reason.clone());
            state.enqueue(StreamEvent::End(reason));
        }
        self.drain();
        true
    }

    /// End the stream when `lease` is cut off, with the lease's reason.
    pub fn bind(&self, lease: &Lease) -> &Self {
        let tie = lease.derive();
        let stream = Arc::downgrade(&self.shared);
        tie.when_off(move |reason| {
            if let Some(shared) = stream.upgrade() {
                ValueStream { shared }.end(reason);
            }
        });

        // Release the tie once the stream ends on its own.
        let tie_on_end = tie.clone();
        self.subscribe(move |event| {
            if let StreamEvent::End(_) = event {
                tie_on_end.off();
            }
        });
        self
    }

    /// Subscribe to this stream.
    ///
    /// The current value (or the end, for ended streams) is replayed before any later
    /// event. Unless another frame is delivering, that happens before returning. Cutting
    /// off the returned lease unsubscribes; it is cut off automatically once the stream
    /// ends.
    pub fn subscribe(&self, observer: impl Fn(&StreamEvent<T>) + Send + Sync + 'static) -> Lease {
        let lease = Lease::new();
        let observer: Observer<T> = Arc::new(observer);
        let active = Arc::new(AtomicBool::new(true));

        let id = {
            let mut state = self.shared.state.lock();
            if let Some(reason) = state.end.clone() {
                drop(state);
                observer(&StreamEvent::End(reason));
                lease.off();
                return lease;
            }
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            let since = state.seq;
            state.subscribers.push(Subscriber {
                id,
                since,
                active: active.clone(),
                observer: observer.clone(),
                lease: lease.clone(),
            });
            if let Some(value) = state.current.clone() {
                state.pending.push_back(Queued {
                    seq: since,
                    event: StreamEvent::Value(value),
                    only: Some(id),
                });
            }
            id
        };

        let stream: Weak<StreamShared<T>> = Arc::downgrade(&self.shared);
        lease.when_off(move |_| {
            active.store(false, Ordering::Release);
            if let Some(shared) = stream.upgrade() {
                shared.state.lock().subscribers.retain(|s| s.id != id);
            }
        });

        self.drain();
        lease
    }

    /// Derive a stream of values mapped by `map`. It ends when this stream ends.
    pub fn map<U, F>(&self, map: F) -> ValueStream<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let derived = ValueStream::<U>::new();
        let target = derived.clone();
        let subscription = self.subscribe(move |event| match event {
            StreamEvent::Value(value) => {
                target.send(map(value));
            }
            StreamEvent::End(reason) => {
                target.end(reason.clone());
            }
        });
        derived.subscribe(move |event| {
            if let StreamEvent::End(_) = event {
                subscription.off();
            }
        });
        derived
    }

    /// Wait for the first value (current or future) matching `predicate`.
    ///
    /// Fails with the stream's end reason, or [`ContextError::Cancelled`] when the stream
    /// ends without one.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Result<T, ContextError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = SubscriptionGuard(self.subscribe(move |event| {
            let outcome = match event {
                StreamEvent::Value(value) if predicate(value) => Ok(value.clone()),
                StreamEvent::Value(_) => return,
                StreamEvent::End(reason) => Err(reason.clone().unwrap_or(ContextError::Cancelled)),
            };
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(outcome);
            }
        }));
        let result = rx.await.unwrap_or(Err(ContextError::Cancelled));
        drop(subscription);
        result
    }

    /// Receive every event of this stream as an asynchronous [`Stream`].
    pub fn updates(&self) -> Updates<T> {
        let (tx, receiver) = mpsc::unbounded();
        let subscription = self.subscribe(move |event| {
            let _ = tx.unbounded_send(event.clone());
        });
        Updates {
            receiver,
            _subscription: SubscriptionGuard(subscription),
        }
    }

    fn drain(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.emitting {
                return;
            }
            state.emitting = true;
        }

        loop {
            let (event, targets) = {
                let mut state = self.shared.state.lock();
                let Some(Queued { seq, event, only }) = state.pending.pop_front() else {
                    state.emitting = false;
                    return;
                };
                let targets: Vec<_> = state
                    .subscribers
                    .iter()
                    .filter(|subscriber| match only {
                        Some(id) => subscriber.id == id,
                        None => subscriber.since < seq,
                    })
                    .map(|subscriber| (subscriber.active.clone(), subscriber.observer.clone()))
                    .collect();
                (event, targets)
            };

            for (active, observer) in targets {
                if active.load(Ordering::Acquire) {
                    observer(&event);
                }
            }

            if let StreamEvent::End(_) = event {
                let finished = std::mem::take(&mut self.shared.state.lock().subscribers);
                for subscriber in finished {
                    subscriber.lease.off();
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ValueStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ValueStream")
            .field("current", &state.current)
            .field("ended", &state.end.is_some())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Cuts a subscription off when dropped.
struct SubscriptionGuard(Lease);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.off();
    }
}

/// Asynchronous view of a [`ValueStream`]'s events. Unsubscribes when dropped.
pub struct Updates<T> {
    receiver: mpsc::UnboundedReceiver<StreamEvent<T>>,
    _subscription: SubscriptionGuard,
}

impl<T> Stream for Updates<T> {
    type Item = StreamEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
