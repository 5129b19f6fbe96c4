//! Integration tests for updatable keys and value streams

use futures::StreamExt;
use seedbed::{
    ContextError, ContextKey, ProviderSpec, Registry, StreamEvent, UpdatableKey,
    UpdatableMultiKey, UpdatableProvider, ValueStream,
};

#[test]
fn test_multi_stream_tracks_registrations() {
    let registry = Registry::new();
    let key = UpdatableMultiKey::<&str>::new("routes");
    let context = registry.new_values();
    let routes = context.get(&key).unwrap();
    assert_eq!(routes.current(), Some(Vec::new()));

    let home = registry.provide(&key, ProviderSpec::value("/"));
    let _about = registry.provide(&key, ProviderSpec::value("/about"));
    assert_eq!(routes.current(), Some(vec!["/", "/about"]));

    home.off();
    assert_eq!(routes.current(), Some(vec!["/about"]));
}

#[test]
fn test_same_stream_returned_from_cache() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level");
    let _lease = registry.provide(&key, ProviderSpec::value(1));
    let context = registry.new_values();

    let first = context.get(&key).unwrap();
    let second = context.get(&key).unwrap();
    assert!(first.same_as(&second));
}

#[test]
fn test_updatable_and_multi_share_seed_key() {
    let registry = Registry::new();
    let levels = UpdatableMultiKey::<u8>::new("levels");
    let latest = UpdatableKey::<u8>::new("latest").with_seed_key(levels.seed_key().clone());
    let _one = registry.provide(&levels, ProviderSpec::value(1));
    let _two = registry.provide(&latest, ProviderSpec::value(2));

    let context = registry.new_values();
    assert_eq!(context.get(&levels).unwrap().current(), Some(vec![1, 2]));
    assert_eq!(context.get(&latest).unwrap().current(), Some(2));
}

#[test]
fn test_chained_registry_updates_reach_combined_context() {
    let base = Registry::new();
    let overlay = Registry::new();
    let key = UpdatableMultiKey::<&str>::new("layers");
    let _own = overlay.provide(&key, ProviderSpec::value("overlay"));

    let combined = base.append(&overlay);
    let context = combined.new_values();
    let layers = context.get(&key).unwrap();
    assert_eq!(layers.current(), Some(vec!["overlay"]));

    let late = base.provide(&key, ProviderSpec::value("base"));
    assert_eq!(layers.current(), Some(vec!["base", "overlay"]));

    late.off();
    assert_eq!(layers.current(), Some(vec!["overlay"]));
}

#[test]
fn test_failing_provider_ends_stream() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level");
    let _broken = registry.provide(
        &key,
        UpdatableProvider::<u8>::new(|_| Err(ContextError::Config("unreachable backend".to_string()))),
    );

    let context = registry.new_values();
    let stream = context.get(&key).unwrap();
    assert!(matches!(stream.end_reason(), Some(ContextError::Config(_))));
}

#[test]
fn test_ended_contribution_stream_is_withdrawn() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level").with_default(ProviderSpec::value(0));
    let source = ValueStream::with_value(vec![5]);
    let _lease = registry.provide(&key, source.clone());

    let context = registry.new_values();
    let level = context.get(&key).unwrap();
    assert_eq!(level.current(), Some(5));

    source.send(vec![6, 7]);
    assert_eq!(level.current(), Some(7));

    source.end(None);
    assert_eq!(level.current(), Some(0));
}

#[test]
fn test_subscribers_see_every_change() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level");
    let _first = registry.provide(&key, ProviderSpec::value(1));
    let context = registry.new_values();
    let level = context.get(&key).unwrap();

    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let _subscription = level.subscribe(move |event| {
        if let StreamEvent::Value(value) = event {
            recorder.lock().push(*value);
        }
    });

    let second = registry.provide(&key, ProviderSpec::value(2));
    second.off();
    assert_eq!(*seen.lock(), vec![1, 2, 1]);
}

#[tokio::test]
async fn test_updates_as_async_stream() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level");
    let _first = registry.provide(&key, ProviderSpec::value(1));
    let context = registry.new_values();
    let mut updates = context.get(&key).unwrap().updates();

    assert!(matches!(updates.next().await, Some(StreamEvent::Value(1))));

    let _second = registry.provide(&key, ProviderSpec::value(2));
    assert!(matches!(updates.next().await, Some(StreamEvent::Value(2))));

    context.destroy(None);
    let mut ended = false;
    while let Some(event) = updates.next().await {
        if let StreamEvent::End(_) = event {
            ended = true;
            break;
        }
    }
    assert!(ended);
}

#[tokio::test]
async fn test_wait_for_value() {
    let registry = Registry::new();
    let key = UpdatableKey::<u8>::new("level").with_default(ProviderSpec::value(0));
    let context = registry.new_values();
    let level = context.get(&key).unwrap();

    let waiter = tokio::spawn({
        let level = level.clone();
        async move { level.wait_for(|value| *value >= 3).await }
    });
    tokio::task::yield_now().await;

    let _low = registry.provide(&key, ProviderSpec::value(1));
    let _high = registry.provide(&key, ProviderSpec::value(3));
    assert_eq!(waiter.await.unwrap().unwrap(), 3);
}
