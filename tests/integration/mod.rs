//! Integration tests for seedbed contexts, keys and modules

mod context_values;
mod module_lifecycle;
mod module_replacement;
mod updatable_keys;
