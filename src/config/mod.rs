//! Uplink Configuration Module
//!
//! Provides the uplink configuration loaded from a TOML file.
//!
//! ## Loading Order
//!
//! 1. `UPLINK_CONFIG` environment variable (path to TOML file)
//! 2. `uplink.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! The loaded config is passed explicitly to the queue, client and
//! controller; there is no global instance.

mod uplink_config;
pub mod defaults;
pub mod validation;

pub use uplink_config::*;
