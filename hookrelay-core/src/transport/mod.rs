//! Duplex transport between a helper and the controller.
//!
//! A [`Channel`] is one TCP link framed with [`RelayCodec`](crate::codec::RelayCodec).
//! It never reconnects on its own: the owner opens a fresh channel after
//! the old one is `Broken`.

mod channel;
mod endpoint;

pub use channel::{Channel, ChannelOptions, Inbound};
pub use endpoint::Endpoint;
