//! Integration tests for module replacement through `has`

use seedbed::{Module, ModuleImpl, ProviderSpec, Registry, SingleKey};

use super::test_utils::{ready, recording_module, Counter, Journal};

#[tokio::test]
async fn test_replaced_module_reports_replacement() {
    let registry = Registry::new();
    let journal = Journal::new();
    let (a_setups, r_setups) = (Counter::new(), Counter::new());
    let a = recording_module(Module::builder("a"), &journal, &a_setups);
    let r = recording_module(Module::builder("r").has(&a), &journal, &r_setups);

    let _replacement = registry.provide_module(&r);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    assert_eq!(handle.module(), r);
    assert!(matches!(
        handle.implementation(),
        Some(ModuleImpl::Replacement { ref target, ref by }) if *target == a && *by == r
    ));

    let usage = handle.use_by(None);
    let status = ready(&usage).await;
    assert_eq!(status.module, r);
    assert!(status.provided && status.used && status.ready);
    assert_eq!(a_setups.get(), 0);
    assert_eq!(r_setups.get(), 1);

    let replacing = context.get(&r).unwrap().status();
    assert!(replacing.used && replacing.ready);

    usage.release();
    assert!(!context.get(&r).unwrap().status().used);
    assert!(!handle.status().used);
}

#[tokio::test]
async fn test_replacement_takes_precedence_over_original() {
    let registry = Registry::new();
    let journal = Journal::new();
    let (a_setups, r_setups) = (Counter::new(), Counter::new());
    let a = recording_module(Module::builder("a"), &journal, &a_setups);
    let r = recording_module(Module::builder("r").has(&a), &journal, &r_setups);

    let _original = registry.provide_module(&a);
    let replacement = registry.provide_module(&r);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    let usage = handle.use_by(None);
    assert_eq!(ready(&usage).await.module, r);

    replacement.off();
    let status = ready(&usage).await;
    assert_eq!(status.module, a);
    assert_eq!(journal.entries(), vec!["r", "a"]);
    assert!(!context.get(&r).unwrap().status().used);
}

#[tokio::test]
async fn test_withdrawn_replacement_leaves_target_unprovided() {
    let registry = Registry::new();
    let journal = Journal::new();
    let setups = Counter::new();
    let a = Module::new("a");
    let r = recording_module(Module::builder("r").has(&a), &journal, &setups);

    let replacement = registry.provide_module(&r);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    let usage = context.get(&r).unwrap().use_by(None);
    ready(&usage).await;
    assert!(handle.status().provided);
    assert!(handle.status().ready);

    replacement.off();
    let status = handle.status();
    assert!(!status.provided);
    assert!(!status.ready);
    assert_eq!(status.module, a);
    assert!(handle.implementation().is_none());
    assert_eq!(handle.module(), a);
}

#[test]
fn test_latest_replacement_wins() {
    let registry = Registry::new();
    let a = Module::new("a");
    let first = Module::builder("first").has(&a).build();
    let second = Module::builder("second").has(&a).build();

    let _first = registry.provide_module(&first);
    let late = registry.provide_module(&second);
    assert_eq!(registry.new_values().get(&a).unwrap().module(), second);

    late.off();
    assert_eq!(registry.new_values().get(&a).unwrap().module(), first);
}

#[tokio::test]
async fn test_replacement_may_need_what_it_replaces() {
    let registry = Registry::new();
    let settings = SingleKey::<&str>::new("settings");
    let a = Module::new("a");

    let key = settings.clone();
    let r = Module::builder("r")
        .needs(&a)
        .has(&a)
        .sync_setup(move |setup| {
            setup.provide(&key, ProviderSpec::value("from r"));
            Ok(())
        })
        .build();

    let _replacement = registry.provide_module(&r);
    let context = registry.new_values();
    let usage = context.get(&r).unwrap().use_by(None);
    ready(&usage).await;
    assert_eq!(registry.new_values().get(&settings).unwrap(), "from r");
}

#[tokio::test]
async fn test_dependant_loads_replacement() {
    let registry = Registry::new();
    let journal = Journal::new();
    let setups = Counter::new();
    let storage = recording_module(Module::builder("storage"), &journal, &setups);
    let memory = recording_module(Module::builder("memory").has(&storage), &journal, &setups);
    let app = recording_module(Module::builder("app").needs(&storage), &journal, &setups);

    let _memory = registry.provide_module(&memory);
    let _app = registry.provide_module(&app);
    let context = registry.new_values();
    let usage = context.get(&app).unwrap().use_by(None);
    ready(&usage).await;

    assert_eq!(journal.entries(), vec!["memory", "app"]);
    assert_eq!(context.get(&storage).unwrap().status().module, memory);
}
