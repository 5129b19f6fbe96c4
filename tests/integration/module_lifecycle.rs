//! Integration tests for module loading, reference counting and failure propagation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use seedbed::{
    ContextError, Lease, Module, ModuleSettings, ModuleSetup, ProviderSpec, Registry, SingleKey,
};
use tokio::sync::Notify;

use super::test_utils::{ready, recording_module, settle_tasks, Counter, Journal};

#[tokio::test]
async fn test_dependency_settles_before_dependant_setup() {
    let registry = Registry::new();
    let greeting = SingleKey::<String>::new("greeting");
    let journal = Journal::new();

    let key = greeting.clone();
    let log = journal.clone();
    let a = Module::builder("a")
        .sync_setup(move |setup| {
            setup.provide(&key, ProviderSpec::value("hello".to_string()));
            log.record("a");
            Ok(())
        })
        .build();

    let key = greeting.clone();
    let log = journal.clone();
    let b = Module::builder("b")
        .needs(&a)
        .sync_setup(move |setup| {
            let greeting = setup.get(&key)?;
            log.record(format!("b saw {}", greeting));
            Ok(())
        })
        .build();

    let _provided = registry.provide_module(&b);
    let context = registry.new_values();
    let usage = context.get(&b).unwrap().use_by(None);
    let status = ready(&usage).await;

    assert!(status.provided && status.used && status.settled && status.ready);
    assert_eq!(journal.entries(), vec!["a", "b saw hello"]);

    let a_status = context.get(&a).unwrap().status();
    assert!(a_status.provided && a_status.used && a_status.ready);
}

#[tokio::test]
async fn test_uses_are_reference_counted() {
    let registry = Registry::new();
    let journal = Journal::new();
    let setups = Counter::new();
    let a = recording_module(Module::builder("a"), &journal, &setups);
    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();

    let first = handle.use_by(None);
    let second = handle.use_by(None);
    ready(&first).await;
    ready(&second).await;
    assert_eq!(setups.get(), 1);

    assert!(first.release());
    assert!(!first.release());
    let status = handle.status();
    assert!(status.used && status.ready);

    second.release();
    let status = handle.status();
    assert!(!status.used && !status.settled && !status.ready);

    let third = handle.use_by(None);
    ready(&third).await;
    assert_eq!(setups.get(), 2);
}

#[tokio::test]
async fn test_use_ends_with_user_lease() {
    let registry = Registry::new();
    let setups = Counter::new();
    let a = recording_module(Module::builder("a"), &Journal::new(), &setups);
    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();

    let user = Lease::new();
    let usage = handle.use_by(Some(&user));
    ready(&usage).await;

    user.off();
    assert!(usage.is_released());
    assert!(!handle.status().used);

    let late = handle.use_by(Some(&Lease::cut(None)));
    assert!(late.is_released());
    assert!(matches!(
        late.when_ready().await,
        Err(ContextError::ModuleUnloaded { .. })
    ));
    assert_eq!(setups.get(), 1);
}

#[tokio::test]
async fn test_release_during_setup_aborts_revision() {
    let registry = Registry::new();
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let (on_start, on_gate, on_finish) = (started.clone(), gate.clone(), finished.clone());
    let a = Module::builder("slow")
        .setup(move |_| {
            let (started, gate, finished) = (on_start.clone(), on_gate.clone(), on_finish.clone());
            async move {
                started.notify_one();
                gate.notified().await;
                finished.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .build();
    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();

    let usage = handle.use_by(None);
    started.notified().await;
    usage.release();
    gate.notify_one();
    settle_tasks().await;

    assert!(!finished.load(Ordering::SeqCst));
    let status = handle.status();
    assert!(!status.used && !status.settled && status.error.is_none());
}

#[tokio::test]
async fn test_withdrawing_module_stops_it() {
    let registry = Registry::new();
    let flag = SingleKey::<bool>::new("flag");
    let key = flag.clone();
    let a = Module::builder("a")
        .sync_setup(move |setup| {
            setup.provide(&key, ProviderSpec::value(true));
            Ok(())
        })
        .build();

    let provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    let usage = handle.use_by(None);
    ready(&usage).await;
    assert!(registry.new_values().get(&flag).unwrap());

    provided.off();
    let status = handle.status();
    assert!(!status.provided && status.used && !status.ready);
    assert!(matches!(
        registry.new_values().get(&flag),
        Err(ContextError::MissingValue { .. })
    ));

    let _again = registry.provide_module(&a);
    let status = ready(&usage).await;
    assert!(status.provided && status.ready);
}

#[tokio::test]
async fn test_setup_failure_withdraws_provided_values() {
    let registry = Registry::new();
    let flag = SingleKey::<bool>::new("flag");
    let key = flag.clone();
    let a = Module::builder("a")
        .sync_setup(move |setup| {
            setup.provide(&key, ProviderSpec::value(true));
            anyhow::bail!("disk full")
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    let usage = handle.use_by(None);

    let err = usage.when_ready().await.unwrap_err();
    assert!(matches!(&err, ContextError::SetupFailed { module, .. } if module == "[Module a]"));
    assert!(err.to_string().contains("disk full"));
    assert!(handle.status().is_failed());
    assert!(matches!(
        registry.new_values().get(&flag),
        Err(ContextError::MissingValue { .. })
    ));
}

#[tokio::test]
async fn test_dependency_failure_fails_dependant() {
    let registry = Registry::new();
    let a = Module::builder("a")
        .sync_setup(|_| anyhow::bail!("no credentials"))
        .build();
    let setups = Counter::new();
    let b = recording_module(Module::builder("b").needs(&a), &Journal::new(), &setups);

    let _provided = registry.provide_module(&b);
    let context = registry.new_values();
    let usage = context.get(&b).unwrap().use_by(None);

    let err = usage.when_settled().await.unwrap_err();
    let failures = err.dependency_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].module, "[Module a]");
    assert!(matches!(failures[0].reason, ContextError::SetupFailed { .. }));
    assert_eq!(setups.get(), 0);
}

#[tokio::test]
async fn test_unloading_releases_dependencies() {
    let registry = Registry::new();
    let journal = Journal::new();
    let setups = Counter::new();
    let a = recording_module(Module::builder("a"), &journal, &setups);
    let b = recording_module(Module::builder("b").needs(&a).needs_itself(), &journal, &setups);

    let _provided = registry.provide_module(&b);
    let context = registry.new_values();
    let a_handle = context.get(&a).unwrap();
    let usage = context.get(&b).unwrap().use_by(None);
    ready(&usage).await;
    assert_eq!(journal.entries(), vec!["a", "b"]);
    assert!(a_handle.status().used);

    usage.release();
    let status = a_handle.status();
    assert!(!status.used && !status.provided);
}

#[tokio::test]
async fn test_initializers_run_in_order_after_setup() {
    let registry = Registry::new();
    let journal = Journal::new();
    let gate = Arc::new(Notify::new());

    let (log, init_gate) = (journal.clone(), gate.clone());
    let a = Module::builder("a")
        .setup(move |setup| {
            let (log, init_gate) = (log.clone(), init_gate.clone());
            async move {
                let first = log.clone();
                setup.init_by(move || async move {
                    init_gate.notified().await;
                    first.record("first initializer");
                    anyhow::Ok(())
                })?;
                let second = log.clone();
                setup.init_by(move || async move {
                    second.record("second initializer");
                    anyhow::Ok(())
                })?;
                log.record("setup");
                anyhow::Ok(())
            }
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let usage = context.get(&a).unwrap().use_by(None);

    let settled = usage.when_settled().await.unwrap();
    assert!(settled.settled && !settled.ready);
    assert_eq!(journal.entries(), vec!["setup"]);

    gate.notify_one();
    ready(&usage).await;
    assert_eq!(
        journal.entries(),
        vec!["setup", "first initializer", "second initializer"]
    );
}

#[tokio::test]
async fn test_initializer_after_ready_is_rejected() {
    let registry = Registry::new();
    let kept: Arc<Mutex<Option<ModuleSetup>>> = Arc::new(Mutex::new(None));
    let store = kept.clone();
    let a = Module::builder("a")
        .sync_setup(move |setup| {
            *store.lock() = Some(setup.clone());
            Ok(())
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let usage = context.get(&a).unwrap().use_by(None);
    ready(&usage).await;

    let setup = kept.lock().clone().unwrap();
    let err = setup.init_by(|| async { anyhow::Ok(()) }).unwrap_err();
    assert!(matches!(err, ContextError::InitChainDrained { .. }));
}

#[tokio::test]
async fn test_initializer_after_failed_setup_is_rejected() {
    let registry = Registry::new();
    let kept: Arc<Mutex<Option<ModuleSetup>>> = Arc::new(Mutex::new(None));
    let store = kept.clone();
    let a = Module::builder("a")
        .sync_setup(move |setup| {
            *store.lock() = Some(setup.clone());
            Err(anyhow::anyhow!("broken setup"))
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let usage = context.get(&a).unwrap().use_by(None);
    let err = usage.when_settled().await.unwrap_err();
    assert!(matches!(err, ContextError::SetupFailed { .. }));

    let setup = kept.lock().clone().unwrap();
    let err = setup.init_by(|| async { anyhow::Ok(()) }).unwrap_err();
    assert!(matches!(err, ContextError::InitChainDrained { .. }));
}

#[tokio::test]
async fn test_failing_initializer_fails_module() {
    let registry = Registry::new();
    let a = Module::builder("a")
        .sync_setup(|setup| {
            setup.init_by(|| async { Err::<(), _>(anyhow::anyhow!("warmup failed")) })?;
            Ok(())
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let usage = context.get(&a).unwrap().use_by(None);

    let err = usage.when_ready().await.unwrap_err();
    assert!(matches!(err, ContextError::InitFailed { .. }));
    assert!(err.to_string().contains("warmup failed"));
}

#[tokio::test]
async fn test_setup_uses_other_module() {
    let registry = Registry::new();
    let journal = Journal::new();
    let setups = Counter::new();
    let helper = recording_module(Module::builder("helper"), &journal, &setups);

    let dynamic = helper.clone();
    let log = journal.clone();
    let host = Module::builder("host")
        .setup(move |setup| {
            let (helper, log) = (dynamic.clone(), log.clone());
            async move {
                setup.provide_module(&helper);
                let usage = setup.get(&helper)?.use_by(Some(setup.lease()));
                usage.when_ready().await?;
                log.record("host");
                anyhow::Ok(())
            }
        })
        .build();

    let _provided = registry.provide_module(&host);
    let context = registry.new_values();
    let usage = context.get(&host).unwrap().use_by(None);
    ready(&usage).await;
    assert_eq!(journal.entries(), vec!["helper", "host"]);

    usage.release();
    assert!(!context.get(&helper).unwrap().status().used);
}

#[tokio::test]
async fn test_settle_timeout() {
    let registry = Registry::with_settings(ModuleSettings {
        settle_timeout_ms: Some(50),
        ..ModuleSettings::default()
    });
    let gate = Arc::new(Notify::new());
    let waiting = gate.clone();
    let a = Module::builder("stuck")
        .setup(move |_| {
            let gate = waiting.clone();
            async move {
                gate.notified().await;
                anyhow::Ok(())
            }
        })
        .build();

    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let usage = context.get(&a).unwrap().use_by(None);

    let err = usage.when_settled().await.unwrap_err();
    assert!(matches!(err, ContextError::Timeout { phase: "settled", .. }));
}

#[tokio::test]
async fn test_destroying_context_unloads_modules() {
    let registry = Registry::new();
    let setups = Counter::new();
    let a = recording_module(Module::builder("a"), &Journal::new(), &setups);
    let _provided = registry.provide_module(&a);
    let context = registry.new_values();
    let handle = context.get(&a).unwrap();
    let usage = handle.use_by(None);
    ready(&usage).await;

    let statuses = handle.read();
    context.destroy(None);
    assert!(statuses.is_ended());
    assert!(!handle.status().ready);
}
