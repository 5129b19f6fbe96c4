//! Key flavors
//!
//! Every flavor is a [`ContextKey`](crate::ContextKey) with its own growth rule:
//!
//! * [`SingleKey`]: the most recent non-empty contribution wins.
//! * [`MultiKey`]: every non-empty contribution, in registration order.
//! * [`UpdatableKey`] / [`UpdatableMultiKey`]: the same rules, re-derived on every change
//!   of the contributions and delivered as a [`ValueStream`](crate::ValueStream).

mod multi;
mod single;
mod updatable;

pub use multi::MultiKey;
pub use single::SingleKey;
pub use updatable::{UpdatableKey, UpdatableMultiKey};
