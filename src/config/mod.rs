//! Configuration module
//!
//! Handles loading and validating the hub configuration.

mod settings;

pub use settings::*;
