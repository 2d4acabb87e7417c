//! # relay-server: Tracking Relay Server
//!
//! Exposes the host's tracking devices to relay clients over a framed
//! TCP session and answers discovery probes on the shared UDP port.
//!
//! A client role can run in the same process; it refuses to connect to
//! this process's own server.

pub mod config;
pub mod service;
