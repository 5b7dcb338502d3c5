//! Database module for PulseTrail.
//!
//! Monitor definitions and probe results, the store capabilities the
//! scheduler depends on, and the SQLite implementation of them.

mod models;
mod store;
mod traits;

#[cfg(test)]
pub mod memory;

pub use models::*;
pub use store::*;
pub use traits::*;
