//! Broadcast hub core
//!
//! Message codec, peer handles, the peer registry and the relay that fans
//! every queued message out to all registered peers.

mod message;
mod peer;
mod registry;
mod relay;

pub use message::*;
pub use peer::*;
pub use registry::*;
pub use relay::*;
