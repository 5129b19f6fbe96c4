//! Integration tests for context value growth, caching and registry chaining

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use seedbed::seed::Fixed;
use seedbed::{
    ContextError, ContextKey, FromContext, KeyId, MultiKey, ProviderSpec, Registry, SeedKey,
    SingleKey, ValueSlot,
};

/// Key that counts how often its setup hook runs.
struct HookedKey {
    id: KeyId,
    seed_key: SeedKey<Fixed<u32>>,
    hooks: Arc<AtomicUsize>,
}

impl HookedKey {
    fn new() -> Self {
        Self {
            id: KeyId::next(),
            seed_key: SeedKey::new("hooked"),
            hooks: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ContextKey for HookedKey {
    type Value = u32;
    type Kind = Fixed<u32>;

    fn id(&self) -> KeyId {
        self.id
    }

    fn name(&self) -> &str {
        "hooked"
    }

    fn seed_key(&self) -> &SeedKey<Fixed<u32>> {
        &self.seed_key
    }

    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError> {
        if let Some(value) = slot.seed().last()? {
            let hooks = self.hooks.clone();
            slot.setup(move |_| {
                hooks.fetch_add(1, Ordering::SeqCst);
            });
            slot.insert(value);
        }
        Ok(())
    }
}

fn host_key() -> &'static SingleKey<String> {
    static KEY: OnceLock<SingleKey<String>> = OnceLock::new();
    KEY.get_or_init(|| SingleKey::new("host"))
}

#[derive(Clone, Debug, PartialEq)]
struct Endpoint {
    url: String,
}

impl FromContext for Endpoint {
    fn from_context(context: &seedbed::Context) -> Result<Self, ContextError> {
        Ok(Endpoint {
            url: format!("http://{}", context.get(host_key())?),
        })
    }
}

#[test]
fn test_value_cached_per_context() {
    let registry = Registry::new();
    let key = SingleKey::<&str>::new("mode");
    let _first = registry.provide(&key, ProviderSpec::value("first"));

    let context = registry.new_values();
    assert_eq!(context.get(&key).unwrap(), "first");

    let _second = registry.provide(&key, ProviderSpec::value("second"));
    assert_eq!(context.get(&key).unwrap(), "first");
    assert_eq!(registry.new_values().get(&key).unwrap(), "second");
}

#[test]
fn test_withdrawn_registration_not_seen_by_new_contexts() {
    let registry = Registry::new();
    let key = SingleKey::<&str>::new("mode");
    let _base = registry.provide(&key, ProviderSpec::value("base"));
    let overlay = registry.provide(&key, ProviderSpec::value("overlay"));
    assert_eq!(registry.new_values().get(&key).unwrap(), "overlay");

    assert!(overlay.off());
    assert!(!overlay.off());
    assert_eq!(registry.new_values().get(&key).unwrap(), "base");
}

#[test]
fn test_cached_value_survives_withdrawal() {
    let registry = Registry::new();
    let key = SingleKey::<&str>::new("mode");
    let _a = registry.provide(&key, ProviderSpec::value("a"));
    let b = registry.provide(&key, ProviderSpec::value("b"));

    let populated = registry.new_values();
    assert_eq!(populated.get(&key).unwrap(), "b");

    b.off();
    assert_eq!(populated.get(&key).unwrap(), "b");
    assert_eq!(registry.new_values().get(&key).unwrap(), "a");
}

#[test]
fn test_setup_hook_runs_once_per_context() {
    let registry = Registry::new();
    let key = HookedKey::new();
    let _lease = registry.provide(&key, ProviderSpec::value(3));

    let first = registry.new_values();
    assert_eq!(first.get(&key).unwrap(), 3);
    assert_eq!(first.get(&key).unwrap(), 3);
    assert_eq!(key.hooks.load(Ordering::SeqCst), 1);

    let second = registry.new_values();
    assert_eq!(second.get(&key).unwrap(), 3);
    assert_eq!(key.hooks.load(Ordering::SeqCst), 2);
}

#[test]
fn test_fallback_value_is_not_cached() {
    let registry = Registry::new();
    let key = HookedKey::new();
    let context = registry.new_values();

    assert_eq!(context.get_or(&key, Some(9)).unwrap(), Some(9));
    assert!(matches!(context.get(&key), Err(ContextError::MissingValue { .. })));
    assert_eq!(key.hooks.load(Ordering::SeqCst), 0);

    let _lease = registry.provide(&key, ProviderSpec::value(4));
    assert_eq!(context.get(&key).unwrap(), 4);
}

#[test]
fn test_multi_key_concatenates_in_registration_order() {
    let registry = Registry::new();
    let key = MultiKey::<&str>::new("plugins");
    let _a = registry.provide(&key, ProviderSpec::value("a"));
    let _skip = registry.provide(&key, ProviderSpec::by(|_| None));
    let _b = registry.provide(&key, ProviderSpec::value("b"));

    let values = registry.new_values().get(&key).unwrap();
    assert_eq!(values.to_vec(), vec!["a", "b"]);
}

#[test]
fn test_appended_registries_contribute_in_chain_order() {
    let base = Registry::new();
    let plugins = Registry::new();
    let key = MultiKey::<&str>::new("layers");
    let _base = base.provide(&key, ProviderSpec::value("base"));
    let _plugin = plugins.provide(&key, ProviderSpec::value("plugin"));

    let combined = base.append(&plugins);
    let _own = combined.provide(&key, ProviderSpec::value("own"));

    let values = combined.new_values().get(&key).unwrap();
    assert_eq!(values.to_vec(), vec!["base", "plugin", "own"]);
    assert_eq!(base.new_values().get(&key).unwrap().to_vec(), vec!["base"]);
}

#[test]
fn test_alias_follows_other_key() {
    let registry = Registry::new();
    let primary = SingleKey::<String>::new("primary");
    let secondary = SingleKey::<String>::new("secondary")
        .with_default(ProviderSpec::value("unset".to_string()));
    let _alias = registry.provide(&secondary, ProviderSpec::alias(primary.clone()));

    assert_eq!(registry.new_values().get(&secondary).unwrap(), "unset");

    let _primary = registry.provide(&primary, ProviderSpec::value("shared".to_string()));
    assert_eq!(registry.new_values().get(&secondary).unwrap(), "shared");
}

#[test]
fn test_provider_by_declared_dependencies() {
    let registry = Registry::new();
    let host = SingleKey::<String>::new("host");
    let port = SingleKey::<u16>::new("port").with_default(ProviderSpec::value(8080));
    let address = SingleKey::<String>::new("address");
    let _host = registry.provide(&host, ProviderSpec::value("localhost".to_string()));
    let _address = registry.provide(
        &address,
        ProviderSpec::by_deps((host.clone(), port.clone()), |(host, port)| {
            Some(format!("{}:{}", host, port))
        }),
    );

    assert_eq!(registry.new_values().get(&address).unwrap(), "localhost:8080");
}

#[test]
fn test_missing_dependency_fails_the_provider() {
    let registry = Registry::new();
    let host = SingleKey::<String>::new("host");
    let address = SingleKey::<String>::new("address");
    let _address = registry.provide(
        &address,
        ProviderSpec::by_deps((host.clone(),), |(host,)| Some(host)),
    );

    let err = registry.new_values().get(&address).unwrap_err();
    assert!(matches!(err, ContextError::MissingValue { key } if key == "host"));
}

#[test]
fn test_constructed_value() {
    let registry = Registry::new();
    let endpoint = SingleKey::<Endpoint>::new("endpoint");
    let _host = registry.provide(host_key(), ProviderSpec::value("example.org".to_string()));
    let _endpoint = registry.provide(&endpoint, ProviderSpec::construct());

    assert_eq!(
        registry.new_values().get(&endpoint).unwrap(),
        Endpoint {
            url: "http://example.org".to_string()
        }
    );
}

#[test]
fn test_destroyed_context_refuses_requests() {
    let registry = Registry::new();
    let key = SingleKey::<u8>::new("level");
    let _lease = registry.provide(&key, ProviderSpec::value(1));
    let context = registry.new_values();
    assert_eq!(context.get(&key).unwrap(), 1);

    let weak = context.downgrade();
    context.destroy(None);
    assert!(context.lease().is_off());
    assert!(matches!(context.get(&key), Err(ContextError::ContextDestroyed)));

    drop(context);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_contexts_are_independent() {
    let registry = Registry::new();
    let first = registry.new_values();
    let second = registry.new_values();

    assert!(!first.same_as(&second));
    assert!(first.same_as(&first.clone()));
    assert!(first.registry().same_as(&registry));
}
