//! Modules
//!
//! A [`Module`] is a named bundle of registrations with declared dependencies (`needs`) and
//! replacement relationships (`has`). A module is itself a key: its value in a context is a
//! [`ModuleHandle`] through which the module is observed and used. Using a handle loads the
//! module: its dependencies are loaded first, then its setup body runs, then the
//! initializers it queued. Releasing the last use unloads it again.
//!
//! Providing a module `M` that declares `has = [A]` provides a replacement for `A` as well;
//! while it is live, `A`'s handle reports and forwards to `M`.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::ContextError;
use crate::key::{ContextKey, KeyId, SeedKey};
use crate::seed::Updatable;
use crate::slot::ValueSlot;

mod handle;
mod loader;
mod setup;

pub use handle::{ModuleHandle, ModuleUse};
pub use setup::ModuleSetup;

pub(crate) type SetupFn =
    dyn Fn(ModuleSetup) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct ModuleDef {
    id: KeyId,
    name: Arc<str>,
    needs: Vec<Module>,
    needs_itself: bool,
    has: Vec<Module>,
    setup: Option<Arc<SetupFn>>,
    seed_key: SeedKey<Updatable<ModuleImpl>>,
}

/// A dynamically loadable bundle of registrations.
///
/// Modules compare by identity; cloning yields the same module.
#[derive(Clone)]
pub struct Module {
    def: Arc<ModuleDef>,
}

impl Module {
    /// Start declaring a module
    pub fn builder(name: impl Into<Arc<str>>) -> ModuleBuilder {
        ModuleBuilder {
            name: name.into(),
            needs: Vec::new(),
            needs_itself: false,
            has: Vec::new(),
            setup: None,
        }
    }

    /// A module without dependencies or setup, typically replaced by another one
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Distinct modules that must be loaded first.
    ///
    /// Includes this module when it was declared to need itself.
    pub fn needs(&self) -> Vec<Module> {
        let mut needs = self.def.needs.clone();
        if self.def.needs_itself {
            needs.push(self.clone());
        }
        needs
    }

    /// Modules this one provides an implementation for, itself first
    pub fn has(&self) -> Vec<Module> {
        std::iter::once(self.clone())
            .chain(self.def.has.iter().cloned())
            .collect()
    }

    pub(crate) fn setup_fn(&self) -> Option<Arc<SetupFn>> {
        self.def.setup.clone()
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.def, &other.def)
    }
}

impl Eq for Module {}

impl Hash for Module {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.id.hash(state);
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Module {}]", self.def.name)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("needs", &self.def.needs.len())
            .field("has", &self.def.has.len())
            .finish()
    }
}

impl ContextKey for Module {
    type Value = ModuleHandle;
    type Kind = Updatable<ModuleImpl>;

    fn id(&self) -> KeyId {
        self.def.id
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn seed_key(&self) -> &SeedKey<Updatable<ModuleImpl>> {
        &self.def.seed_key
    }

    fn grow(&self, slot: &mut ValueSlot<'_, Self>) -> Result<(), ContextError> {
        let handle = ModuleHandle::new(self.clone(), slot.context());
        let implementations = slot.seed().stream().clone();
        let tracked = handle.clone();
        slot.setup(move |_| tracked.track(&implementations));
        slot.insert(handle);
        Ok(())
    }
}

/// Declaration of a [`Module`].
pub struct ModuleBuilder {
    name: Arc<str>,
    needs: Vec<Module>,
    needs_itself: bool,
    has: Vec<Module>,
    setup: Option<Arc<SetupFn>>,
}

impl ModuleBuilder {
    /// Require `module` to be settled before this module's setup runs
    pub fn needs(mut self, module: &Module) -> Self {
        if !self.needs.contains(module) {
            self.needs.push(module.clone());
        }
        self
    }

    /// Declare a dependency on the module being built. Loading skips it.
    pub fn needs_itself(mut self) -> Self {
        self.needs_itself = true;
        self
    }

    /// Supersede `module` while this module is provided
    pub fn has(mut self, module: &Module) -> Self {
        if !self.has.contains(module) {
            self.has.push(module.clone());
        }
        self
    }

    /// Asynchronous setup body
    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: Fn(ModuleSetup) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let body: Arc<SetupFn> =
            Arc::new(move |module_setup: ModuleSetup| setup(module_setup).boxed());
        self.setup = Some(body);
        self
    }

    /// Synchronous setup body
    pub fn sync_setup<F>(self, setup: F) -> Self
    where
        F: Fn(&ModuleSetup) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let setup = Arc::new(setup);
        self.setup(move |module_setup| {
            let result = setup(&module_setup);
            async move { result }
        })
    }

    pub fn build(self) -> Module {
        Module {
            def: Arc::new(ModuleDef {
                id: KeyId::next(),
                seed_key: SeedKey::new(self.name.clone()),
                name: self.name,
                needs: self.needs,
                needs_itself: self.needs_itself,
                has: self.has,
                setup: self.setup,
            }),
        }
    }
}

/// Registered implementation of a module.
#[derive(Clone, PartialEq, Eq)]
pub enum ModuleImpl {
    /// The module implements itself
    Direct(Module),
    /// `by` stands in for `target`
    Replacement { target: Module, by: Module },
}

impl ModuleImpl {
    pub(crate) fn of(target: &Module, provided: &Module) -> Self {
        if target == provided {
            ModuleImpl::Direct(provided.clone())
        } else {
            ModuleImpl::Replacement {
                target: target.clone(),
                by: provided.clone(),
            }
        }
    }

    /// Module whose lookups this implementation answers
    pub fn target(&self) -> &Module {
        match self {
            ModuleImpl::Direct(module) => module,
            ModuleImpl::Replacement { target, .. } => target,
        }
    }

    /// Module that does the work
    pub fn module(&self) -> &Module {
        match self {
            ModuleImpl::Direct(module) => module,
            ModuleImpl::Replacement { by, .. } => by,
        }
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, ModuleImpl::Replacement { .. })
    }

    /// Whether this implementation is `module` standing in for another module
    pub fn is_replacement_by(&self, module: &Module) -> bool {
        matches!(self, ModuleImpl::Replacement { by, .. } if by == module)
    }

    /// Pick the live implementation of a module: the most recent replacement, else the
    /// module itself.
    pub(crate) fn choose(implementations: &[ModuleImpl]) -> Option<ModuleImpl> {
        implementations
            .iter()
            .rev()
            .find(|implementation| implementation.is_replacement())
            .or_else(|| implementations.last())
            .cloned()
    }
}

impl fmt::Display for ModuleImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleImpl::Direct(module) => module.fmt(f),
            ModuleImpl::Replacement { target, by } => {
                write!(f, "[Module {}→{}]", target.name(), by.name())
            }
        }
    }
}

impl fmt::Debug for ModuleImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Snapshot of a module's current load revision.
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    /// Module implementing the looked-up module
    pub module: Module,
    /// Whether an implementation is registered
    pub provided: bool,
    /// Whether at least one use is active
    pub used: bool,
    /// Setup body completed
    pub settled: bool,
    /// Every initializer completed
    pub ready: bool,
    /// Failure of the current revision; terminal for it
    pub error: Option<ContextError>,
}

impl ModuleStatus {
    pub(crate) fn new(module: Module) -> Self {
        Self {
            module,
            provided: false,
            used: false,
            settled: false,
            ready: false,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
