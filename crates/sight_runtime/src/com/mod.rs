//! Signals, slots and the dispatch core connecting them

mod channel;
mod dispatch;
mod signature;
mod slot;

pub use channel::ChannelMember;
pub use dispatch::*;
pub use signature::*;
pub use slot::*;
