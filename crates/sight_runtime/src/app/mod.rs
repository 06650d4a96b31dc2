//! Applications: configuration graphs, their live instances and the launcher
//! switching between them

mod deferred;
mod graph;
mod instance;
mod launcher;

pub use graph::*;
pub use instance::*;
pub use launcher::*;
