//! Task spawning for module revisions.
//!
//! Revisions run on the caller's tokio runtime. Handles used outside of a runtime fall back
//! to a small global one. Every revision task runs inside a `module_revision` span, so events
//! emitted by setup bodies and initializers carry the module they belong to.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

static FALLBACK_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn revision_runtime() -> Handle {
    Handle::try_current().unwrap_or_else(|_| {
        FALLBACK_RUNTIME
            .get_or_init(|| {
                tracing::debug!("no ambient tokio runtime, starting the module runtime");
                Builder::new_multi_thread()
                    .enable_all()
                    .worker_threads(2)
                    .thread_name("seedbed-modules")
                    .build()
                    .expect("failed to build the seedbed module runtime")
            })
            .handle()
            .clone()
    })
}

/// Spawn the task of one module revision.
pub(crate) fn spawn<F>(module: &str, revision: u64, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = info_span!("module_revision", module, revision);
    span.in_scope(|| tracing::trace!("module revision spawned"));
    revision_runtime().spawn(fut.instrument(span))
}
