//! WebSocket server module
//!
//! Accepts websocket upgrades, runs one session per peer and wires every
//! session to the shared registry and relay.

mod handler;
mod origin;
mod websocket;

pub use handler::*;
pub use origin::*;
pub use websocket::*;
