//! tailnetd: per-node daemon giving each scheduled container its own
//! identity and address on the overlay mesh.
//!
//! The binary in `main.rs` wires flags and credentials, recovers persisted
//! pods, and serves the plugin RPC socket. Everything else lives here so
//! integration tests can drive a real daemon in-process.

pub mod bridge;
pub mod error;
pub mod hostname;
pub mod netlink;
pub mod netns;
pub mod node;
pub mod oauth;
pub mod pods;
pub mod server;
pub mod state;

pub use error::{DaemonError, Result};
