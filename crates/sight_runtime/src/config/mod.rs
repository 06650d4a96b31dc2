//! Configuration templates, placeholder substitution and the configuration store

mod app_config;
mod store;
mod substitution;
mod value;

pub use app_config::*;
pub use store::*;
pub use substitution::*;
pub use value::*;
