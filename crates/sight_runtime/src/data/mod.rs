//! Data objects and the factory creating them by type name

mod factory;
mod object;

pub use factory::*;
pub use object::*;
