//! Fanout Hub
//!
//! A websocket broadcast hub. Every JSON message a connected peer sends is
//! validated, queued on a single fan-in queue and relayed to every peer that
//! is connected at the time of the broadcast.

pub mod config;
pub mod hub;
pub mod server;
pub mod shutdown;
