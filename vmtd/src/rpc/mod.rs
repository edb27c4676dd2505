//! RPC channel layer on top of the backdoor primitive.

pub(crate) mod channel;

pub use channel::{Channel, ChannelKind};
