//! Seedbed: Lazily Grown Value Contexts
//!
//! Producers register assets against keys in a [`Registry`]; consumers read values from a
//! [`Context`] created from it. A value is grown from the key's current contributions on
//! first request and cached for the life of the context. [`Module`]s bundle registrations
//! with declared dependencies and are loaded and unloaded dynamically through
//! reference-counted uses.

pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod keys;
pub mod lease;
pub mod logging;
pub mod module;
pub mod provider;
pub mod registry;
pub mod seed;
pub mod slot;
pub mod stream;

mod spawn;

pub use config::{ConfigLoader, ModuleSettings, SeedbedConfig};
pub use context::{Context, WeakContext};
pub use error::{ContextError, DependencyFailure};
pub use key::{ContextKey, KeyId, KeySetup, SeedKey};
pub use keys::{MultiKey, SingleKey, UpdatableKey, UpdatableMultiKey};
pub use lease::Lease;
pub use module::{Module, ModuleBuilder, ModuleHandle, ModuleImpl, ModuleSetup, ModuleStatus, ModuleUse};
pub use provider::{FromContext, Provider, ProviderSpec, UpdatableProvider, UpdateSource};
pub use registry::Registry;
pub use slot::ValueSlot;
pub use stream::{StreamEvent, ValueStream};
