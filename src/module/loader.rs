//! Load revisions.
//!
//! A revision loads one module under one lease:
//!
//! 1. every dependency is provided under the lease and used by it;
//! 2. the revision waits until all dependencies settled;
//! 3. the setup body runs and may queue initializers;
//! 4. the initializer chain drains, starting with a wait for all dependencies to be ready.
//!
//! Any failure cuts the lease off with the reason, which withdraws everything the revision
//! provided and releases its dependencies. A failed or cancelled revision closes its
//! initializer chain.

use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{ContextError, DependencyFailure};
use crate::lease::Lease;
use crate::module::handle::{ModuleHandle, ModuleUse, Phase};
use crate::module::setup::{InitChain, ModuleSetup};
use crate::module::Module;
use crate::spawn::spawn;

/// Spawn revision `revision` of `module`.
pub(crate) fn start(
    handle: ModuleHandle,
    revision: u64,
    lease: Lease,
    module: Module,
    context: Context,
) {
    let name = module.to_string();
    spawn(&name, revision, async move {
        if lease.is_off() {
            debug!(module = %module, revision, "revision ended before it started");
            return;
        }
        let chain = InitChain::new(module.clone());
        let outcome = tokio::select! {
            biased;
            _ = lease.ended() => {
                chain.close();
                debug!(module = %module, revision, "revision cancelled");
                return;
            }
            outcome = load(&handle, revision, &lease, &module, &context, &chain) => outcome,
        };
        if let Err(err) = outcome {
            chain.close();
            warn!(module = %module, revision, error = %err, "module failed to load");
            lease.fail(err);
        }
    });
}

async fn load(
    handle: &ModuleHandle,
    revision: u64,
    lease: &Lease,
    module: &Module,
    context: &Context,
    chain: &Arc<InitChain>,
) -> Result<(), ContextError> {
    let dependencies = use_dependencies(lease, module, context)?;
    wait_all(&dependencies, Phase::Settled).await?;

    if !dependencies.is_empty() {
        let dependencies = dependencies.clone();
        chain.push(Box::new(move || {
            async move { wait_all(&dependencies, Phase::Ready).await }.boxed()
        }))?;
    }

    if let Some(body) = module.setup_fn() {
        let setup = ModuleSetup::new(module.clone(), lease.clone(), context.clone(), chain.clone());
        body(setup)
            .await
            .map_err(|err| ContextError::setup_failed(module, err))?;
    }
    handle.mark(revision, |status| status.settled = true);
    info!(module = %module, revision, "module settled");

    chain.drain().await?;
    handle.mark(revision, |status| status.ready = true);
    info!(module = %module, revision, "module ready");
    Ok(())
}

/// Provide and use every dependency of `module` under `lease`.
fn use_dependencies(
    lease: &Lease,
    module: &Module,
    context: &Context,
) -> Result<Vec<ModuleUse>, ContextError> {
    let mut dependencies = Vec::new();
    for dependency in module.needs() {
        if dependency == *module {
            debug!(module = %module, "skipping dependency on itself");
            continue;
        }
        context.registry().provide_module(&dependency).needs(lease);
        let dependency_handle = context.get(&dependency)?;
        let replaced_by_module = dependency_handle
            .implementation()
            .is_some_and(|implementation| implementation.is_replacement_by(module));
        if replaced_by_module {
            debug!(module = %module, dependency = %dependency, "skipping dependency replaced by the module");
            continue;
        }
        dependencies.push(dependency_handle.use_by(Some(lease)));
    }
    Ok(dependencies)
}

/// Wait until every use reached `phase`; collect the ones that failed.
async fn wait_all(dependencies: &[ModuleUse], phase: Phase) -> Result<(), ContextError> {
    let outcomes = join_all(dependencies.iter().map(|dependency| dependency.wait(phase))).await;
    let failures: Vec<DependencyFailure> = dependencies
        .iter()
        .zip(outcomes)
        .filter_map(|(dependency, outcome)| {
            outcome.err().map(|reason| DependencyFailure {
                module: dependency.handle().target().to_string(),
                reason,
            })
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ContextError::DependencyLoad(failures))
    }
}
