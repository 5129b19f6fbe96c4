//! Module handles: status observation and reference-counted use.
//!
//! A handle follows the implementations registered for its module and selects one. Using
//! the handle activates the selected implementation: a direct implementation starts a new
//! load revision, a replacement forwards the use to the replacing module's handle. While a
//! replacement is selected the handle mirrors the replacing module's status.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ModuleSettings;
use crate::context::{Context, WeakContext};
use crate::error::ContextError;
use crate::lease::Lease;
use crate::module::{loader, Module, ModuleImpl, ModuleStatus};
use crate::stream::{StreamEvent, ValueStream};

/// Lifecycle milestone a use can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Settled,
    Ready,
}

impl Phase {
    fn reached(self, status: &ModuleStatus) -> bool {
        match self {
            Phase::Settled => status.settled,
            Phase::Ready => status.ready,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Settled => "settled",
            Phase::Ready => "ready",
        }
    }

    fn timeout(self, settings: &ModuleSettings) -> Option<Duration> {
        let millis = match self {
            Phase::Settled => settings.settle_timeout_ms,
            Phase::Ready => settings.ready_timeout_ms,
        };
        millis.map(Duration::from_millis)
    }
}

enum Activation {
    Idle,
    /// A load revision of the module itself
    Loading { revision: u64, lease: Lease },
    /// Uses forwarded to the replacing module
    Forwarding { revision: u64, lease: Lease },
}

impl Activation {
    fn revision(&self) -> Option<u64> {
        match self {
            Activation::Idle => None,
            Activation::Loading { revision, .. } | Activation::Forwarding { revision, .. } => {
                Some(*revision)
            }
        }
    }

    fn end(self) -> bool {
        match self {
            Activation::Idle => false,
            Activation::Loading { lease, .. } | Activation::Forwarding { lease, .. } => {
                lease.off();
                true
            }
        }
    }
}

struct HandleState {
    implementation: Option<ModuleImpl>,
    /// Bumped on every change of `implementation`
    selection: u64,
    mirror: Option<Lease>,
    users: usize,
    activation: Activation,
    next_revision: u64,
    status: ModuleStatus,
    /// Bumped on every change of `status`
    seq: u64,
    published: u64,
    tracking: Option<Lease>,
}

struct HandleInner {
    target: Module,
    context: WeakContext,
    settings: ModuleSettings,
    state: Mutex<HandleState>,
    status: ValueStream<ModuleStatus>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for lease in [state.tracking.take(), state.mirror.take()].into_iter().flatten() {
            lease.off();
        }
        std::mem::replace(&mut state.activation, Activation::Idle).end();
    }
}

/// Value of a [`Module`] key in one context.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<HandleInner>,
}

impl ModuleHandle {
    pub(crate) fn new(target: Module, context: &Context) -> Self {
        let status = ModuleStatus::new(target.clone());
        Self {
            inner: Arc::new(HandleInner {
                context: context.downgrade(),
                settings: context.settings().clone(),
                status: ValueStream::with_value(status.clone()),
                state: Mutex::new(HandleState {
                    implementation: None,
                    selection: 0,
                    mirror: None,
                    users: 0,
                    activation: Activation::Idle,
                    next_revision: 1,
                    status,
                    seq: 0,
                    published: 0,
                    tracking: None,
                }),
                target,
            }),
        }
    }

    /// Module this handle was looked up for
    pub fn target(&self) -> &Module {
        &self.inner.target
    }

    /// Currently selected implementation, `None` when not provided
    pub fn implementation(&self) -> Option<ModuleImpl> {
        self.inner.state.lock().implementation.clone()
    }

    /// Module currently implementing the target
    pub fn module(&self) -> Module {
        self.implementation()
            .map(|implementation| implementation.module().clone())
            .unwrap_or_else(|| self.inner.target.clone())
    }

    /// Status of the current revision
    pub fn status(&self) -> ModuleStatus {
        self.inner.state.lock().status.clone()
    }

    /// Stream of status changes, replaying the current status
    pub fn read(&self) -> ValueStream<ModuleStatus> {
        self.inner.status.clone()
    }

    /// Whether both handles refer to the same handle
    pub fn same_as(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Use the module until the returned use is released or `user` ends.
    ///
    /// The first use loads the module; later uses only add to the count.
    pub fn use_by(&self, user: Option<&Lease>) -> ModuleUse {
        let lease = Lease::new();
        if let Some(user) = user {
            lease.needs(user);
        }
        let usage = ModuleUse {
            handle: self.clone(),
            lease: lease.clone(),
        };
        if lease.is_off() {
            return usage;
        }

        let first = {
            let mut state = self.inner.state.lock();
            state.users += 1;
            if state.users == 1 {
                state.status.used = true;
                state.seq += 1;
            }
            state.users == 1
        };
        if first {
            self.publish();
            self.activate();
        }

        let handle = self.clone();
        lease.when_off(move |_| handle.release_one());
        usage
    }

    pub(crate) fn track(&self, implementations: &ValueStream<Vec<ModuleImpl>>) {
        let handle = Arc::downgrade(&self.inner);
        let subscription = implementations.subscribe(move |event| {
            let Some(inner) = handle.upgrade() else {
                return;
            };
            let handle = ModuleHandle { inner };
            match event {
                StreamEvent::Value(implementations) => handle.select(implementations),
                StreamEvent::End(reason) => handle.shut_down(reason.clone()),
            }
        });

        let previous = self.inner.state.lock().tracking.replace(subscription);
        if let Some(previous) = previous {
            previous.off();
        }
    }

    fn select(&self, implementations: &[ModuleImpl]) {
        let chosen = ModuleImpl::choose(implementations);
        let (stale, stale_mirror, selection) = {
            let mut state = self.inner.state.lock();
            if state.implementation == chosen {
                return;
            }
            state.implementation = chosen.clone();
            state.selection += 1;
            state.status = ModuleStatus {
                module: chosen
                    .as_ref()
                    .map_or_else(|| self.inner.target.clone(), |i| i.module().clone()),
                provided: chosen.is_some(),
                used: state.users > 0,
                settled: false,
                ready: false,
                error: None,
            };
            state.seq += 1;
            (
                std::mem::replace(&mut state.activation, Activation::Idle),
                state.mirror.take(),
                state.selection,
            )
        };
        stale.end();
        if let Some(mirror) = stale_mirror {
            mirror.off();
        }

        match &chosen {
            Some(implementation) => {
                info!(module = %self.inner.target, implementation = %implementation, "module implementation selected")
            }
            None => info!(module = %self.inner.target, "module not provided"),
        }
        self.publish();

        if let Some(ModuleImpl::Replacement { by, .. }) = &chosen {
            self.mirror(selection, by);
        }
        self.activate();
    }

    /// Follow the status of the module replacing the target.
    fn mirror(&self, selection: u64, by: &Module) {
        let Some(context) = self.inner.context.upgrade() else {
            return;
        };
        let replacing = match context.get(by) {
            Ok(replacing) => replacing,
            Err(err) => {
                warn!(module = %self.inner.target, replacement = %by, error = %err, "cannot follow replacement");
                return;
            }
        };

        let handle = Arc::downgrade(&self.inner);
        let subscription = replacing.read().subscribe(move |event| {
            let Some(inner) = handle.upgrade() else {
                return;
            };
            if let StreamEvent::Value(status) = event {
                ModuleHandle { inner }.mirror_status(selection, status);
            }
        });

        let stale = {
            let mut state = self.inner.state.lock();
            if state.selection == selection {
                state.mirror.replace(subscription)
            } else {
                Some(subscription)
            }
        };
        if let Some(stale) = stale {
            stale.off();
        }
    }

    fn mirror_status(&self, selection: u64, replacing: &ModuleStatus) {
        {
            let mut state = self.inner.state.lock();
            if state.selection != selection {
                return;
            }
            state.status.module = replacing.module.clone();
            state.status.settled = replacing.settled;
            state.status.ready = replacing.ready;
            state.status.error = replacing.error.clone();
            state.seq += 1;
        }
        self.publish();
    }

    /// Start the selected implementation if the handle is used and nothing is active.
    fn activate(&self) {
        let (revision, lease, implementation) = {
            let mut state = self.inner.state.lock();
            if state.users == 0 || !matches!(state.activation, Activation::Idle) {
                return;
            }
            let Some(implementation) = state.implementation.clone() else {
                return;
            };
            let revision = state.next_revision;
            state.next_revision += 1;
            let lease = Lease::new();
            state.activation = if implementation.is_replacement() {
                Activation::Forwarding {
                    revision,
                    lease: lease.clone(),
                }
            } else {
                Activation::Loading {
                    revision,
                    lease: lease.clone(),
                }
            };
            (revision, lease, implementation)
        };

        let handle = Arc::downgrade(&self.inner);
        lease.when_off(move |reason| {
            if let (Some(reason), Some(inner)) = (reason, handle.upgrade()) {
                ModuleHandle { inner }.fail(revision, reason);
            }
        });

        let Some(context) = self.inner.context.upgrade() else {
            lease.fail(ContextError::ContextDestroyed);
            return;
        };
        lease.needs(context.lease());

        match implementation {
            ModuleImpl::Direct(module) => {
                info!(module = %module, revision, "loading module");
                loader::start(self.clone(), revision, lease, module, context);
            }
            ModuleImpl::Replacement { by, .. } => match context.get(&by) {
                Ok(replacing) => {
                    debug!(module = %self.inner.target, replacement = %by, revision, "forwarding use");
                    replacing.use_by(Some(&lease));
                }
                Err(err) => {
                    lease.fail(err);
                }
            },
        }
    }

    fn release_one(&self) {
        let stale = {
            let mut state = self.inner.state.lock();
            state.users = state.users.saturating_sub(1);
            if state.users > 0 {
                return;
            }
            state.status.used = false;
            let replaced = state
                .implementation
                .as_ref()
                .is_some_and(ModuleImpl::is_replacement);
            if !replaced {
                state.status.settled = false;
                state.status.ready = false;
                state.status.error = None;
            }
            state.seq += 1;
            std::mem::replace(&mut state.activation, Activation::Idle)
        };
        if stale.end() {
            info!(module = %self.inner.target, "module unloaded");
        }
        self.publish();
    }

    fn shut_down(&self, reason: Option<ContextError>) {
        let (stale, mirror) = {
            let mut state = self.inner.state.lock();
            state.implementation = None;
            state.selection += 1;
            state.status.provided = false;
            state.status.settled = false;
            state.status.ready = false;
            state.seq += 1;
            (
                std::mem::replace(&mut state.activation, Activation::Idle),
                state.mirror.take(),
            )
        };
        stale.end();
        if let Some(mirror) = mirror {
            mirror.off();
        }
        self.publish();
        self.inner.status.end(reason);
        debug!(module = %self.inner.target, "module handle shut down");
    }

    /// Update the status of `revision`, if it is still the current one.
    pub(crate) fn mark(&self, revision: u64, update: impl FnOnce(&mut ModuleStatus)) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.activation, Activation::Loading { revision: current, .. } if current == revision)
            {
                return;
            }
            update(&mut state.status);
            state.seq += 1;
        }
        self.publish();
    }

    fn fail(&self, revision: u64, reason: ContextError) {
        {
            let mut state = self.inner.state.lock();
            if state.activation.revision() != Some(revision) {
                return;
            }
            state.status.error = Some(reason.clone());
            state.seq += 1;
        }
        warn!(module = %self.inner.target, revision, error = %reason, "module revision failed");
        self.publish();
    }

    /// Push the latest status, unless it was already pushed.
    fn publish(&self) {
        let inner = &self.inner;
        let mut pushed = None;
        inner.status.update(|_| {
            let mut state = inner.state.lock();
            if state.published == state.seq {
                return None;
            }
            state.published = state.seq;
            pushed = Some(state.status.clone());
            pushed.clone()
        });

        if let (Some(status), true) = (pushed, inner.settings.trace_status) {
            debug!(
                module = %inner.target,
                implementation = %status.module,
                provided = status.provided,
                used = status.used,
                settled = status.settled,
                ready = status.ready,
                failed = status.is_failed(),
                "module status"
            );
        }
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ModuleHandle")
            .field("target", &self.inner.target)
            .field("implementation", &state.implementation)
            .field("users", &state.users)
            .field("status", &state.status)
            .finish()
    }
}

/// One counted use of a module. Released by [`ModuleUse::release`] or when the user's
/// lease ends; dropping it does not release it.
#[derive(Clone)]
pub struct ModuleUse {
    handle: ModuleHandle,
    lease: Lease,
}

impl ModuleUse {
    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }

    pub fn status(&self) -> ModuleStatus {
        self.handle.status()
    }

    /// Lease of this use; cutting it off releases the use
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release this use. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        self.lease.off()
    }

    pub fn is_released(&self) -> bool {
        self.lease.is_off()
    }

    /// Wait until the module's setup body completed
    pub async fn when_settled(&self) -> Result<ModuleStatus, ContextError> {
        self.wait(Phase::Settled).await
    }

    /// Wait until the module's setup body and every initializer completed
    pub async fn when_ready(&self) -> Result<ModuleStatus, ContextError> {
        self.wait(Phase::Ready).await
    }

    pub(crate) async fn wait(&self, phase: Phase) -> Result<ModuleStatus, ContextError> {
        let target = self.handle.target();
        let statuses = self.handle.read();
        let waited = async {
            tokio::select! {
                biased;
                status = statuses.wait_for(move |status| status.is_failed() || phase.reached(status)) => status,
                reason = self.lease.ended() => Err(reason.unwrap_or_else(|| ContextError::ModuleUnloaded {
                    module: target.to_string(),
                })),
            }
        };

        let status = match phase.timeout(&self.handle.inner.settings) {
            Some(limit) => tokio::time::timeout(limit, waited).await.map_err(|_| {
                ContextError::Timeout {
                    module: target.to_string(),
                    phase: phase.name(),
                }
            })??,
            None => waited.await?,
        };
        match status.error {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }
}

impl std::fmt::Debug for ModuleUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleUse")
            .field("module", self.handle.target())
            .field("lease", &self.lease)
            .finish()
    }
}
