//! Scheduler module: one task per monitor, plus the reconciler that keeps
//! the set of tasks in line with the configuration store.

mod alert;
mod classify;
mod monitor;
mod reconcile;
mod registry;

pub use alert::*;
pub use classify::*;
pub use monitor::*;
pub use reconcile::*;
pub use registry::*;

#[cfg(test)]
pub(crate) use monitor::testing;
