//! What a module's setup body works with.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::ContextError;
use crate::key::ContextKey;
use crate::lease::Lease;
use crate::module::Module;
use crate::registry::Registry;
use crate::seed::SeedKind;

pub(crate) type Initializer =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ContextError>> + Send>;

struct ChainState {
    queue: VecDeque<Initializer>,
    drained: bool,
}

/// Strictly serial queue of deferred initializers of one revision.
pub(crate) struct InitChain {
    module: Module,
    state: Mutex<ChainState>,
}

impl InitChain {
    pub(crate) fn new(module: Module) -> Arc<Self> {
        Arc::new(Self {
            module,
            state: Mutex::new(ChainState {
                queue: VecDeque::new(),
                drained: false,
            }),
        })
    }

    pub(crate) fn push(&self, initializer: Initializer) -> Result<(), ContextError> {
        let mut state = self.state.lock();
        if state.drained {
            error!(module = %self.module, "initializer registered after the chain closed");
            return Err(ContextError::InitChainDrained {
                module: self.module.to_string(),
            });
        }
        state.queue.push_back(initializer);
        Ok(())
    }

    /// Refuse further initializers and drop the queued ones.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.drained = true;
        state.queue.clear();
    }

    /// Run initializers one after another, including ones queued while draining.
    ///
    /// Stops at the first failure. The chain accepts no initializers afterwards.
    pub(crate) async fn drain(&self) -> Result<(), ContextError> {
        let mut ran = 0usize;
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.drained = true;
                        debug!(module = %self.module, initializers = ran, "initializer chain drained");
                        return Ok(());
                    }
                }
            };
            ran += 1;
            if let Err(err) = next().await {
                self.close();
                return Err(err);
            }
        }
    }
}

/// Handed to a module's setup body.
///
/// Everything provided through it is withdrawn when the revision ends.
#[derive(Clone)]
pub struct ModuleSetup {
    module: Module,
    lease: Lease,
    context: Context,
    chain: Arc<InitChain>,
}

impl ModuleSetup {
    pub(crate) fn new(module: Module, lease: Lease, context: Context, chain: Arc<InitChain>) -> Self {
        Self {
            module,
            lease,
            context,
            chain,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Lease of the revision being loaded
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn registry(&self) -> &Registry {
        self.context.registry()
    }

    pub fn get<K: ContextKey>(&self, key: &K) -> Result<K::Value, ContextError> {
        self.context.get(key)
    }

    pub fn get_or<K: ContextKey>(
        &self,
        key: &K,
        fallback: Option<K::Value>,
    ) -> Result<Option<K::Value>, ContextError> {
        self.context.get_or(key, fallback)
    }

    /// Register an asset for the lifetime of this revision
    pub fn provide<K: ContextKey>(
        &self,
        key: &K,
        asset: impl Into<<K::Kind as SeedKind>::Asset>,
    ) -> Lease {
        let lease = self.registry().provide(key, asset);
        lease.needs(&self.lease);
        lease
    }

    /// Provide another module for the lifetime of this revision
    pub fn provide_module(&self, module: &Module) -> Lease {
        let lease = self.registry().provide_module(module);
        lease.needs(&self.lease);
        lease
    }

    /// Queue `init` to run after the setup body and every initializer queued before it.
    ///
    /// The module becomes ready once the queue is drained. Fails with
    /// [`ContextError::InitChainDrained`] when called after that, or after the revision
    /// failed or was cancelled.
    pub fn init_by<F, Fut>(&self, init: F) -> Result<(), ContextError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let module = self.module.clone();
        self.chain.push(Box::new(move || {
            async move {
                init()
                    .await
                    .map_err(|err| ContextError::init_failed(&module, err))
            }
            .boxed()
        }))
    }
}

impl std::fmt::Debug for ModuleSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSetup")
            .field("module", &self.module)
            .field("lease", &self.lease)
            .finish()
    }
}
