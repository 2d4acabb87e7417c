//! # relay-client: Tracking Relay Client
//!
//! Finds a relay server through its beacon (or takes an address), mirrors
//! the server's devices through a [`relay_core::RelayBridge`], and prints
//! their state.

pub mod config;
pub mod discovery;
pub mod display;
