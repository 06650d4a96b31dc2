//! Services: lifecycle-managed behavior units bound to data objects

mod base;
pub mod builtin;
mod factory;
mod handle;

pub use base::*;
pub use factory::*;
pub use handle::*;
