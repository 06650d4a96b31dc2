//! Runtime: registry, workers and the context tying the components together

mod context;
mod registry;
mod worker;

pub use context::*;
pub use registry::*;
pub use worker::*;
