//! Per-container overlay engine.
//!
//! Each container scheduled on the node gets its own engine instance: a TUN
//! device in the host namespace, a userspace WireGuard device (boringtun)
//! attached to it, and a [`backend::LocalBackend`] that registers the node's
//! identity with the overlay control plane and pushes the resulting peer
//! configuration into the device over the WireGuard UAPI.
//!
//! ## Subsystem wiring
//!
//! The engine's parts reference each other cyclically (the backend needs the
//! engine, the engine publishes itself for the backend). A [`registry::Registry`]
//! owned by the caller breaks the cycle: construction order is registry →
//! dialer → network monitor → engine → netstack → state store → backend, and
//! each step inserts itself into the registry.
//!
//! ## Identity vs. address
//!
//! The node's cryptographic identity (its WireGuard private key) lives in the
//! [`store::FileStore`] and survives daemon restarts. The overlay address is
//! observed at runtime from the control plane and may change across restarts;
//! reconciliation of kernel routing state is the caller's job.

pub mod backend;
pub mod control;
pub mod device;
pub mod dialer;
pub mod error;
pub mod netmon;
pub mod netstack;
pub mod registry;
pub mod store;
pub mod tun;
pub mod uapi;

pub use backend::{BackendState, LocalBackend, NodeStatus, Prefs, StartOptions};
pub use control::{ControlClient, HttpControlClient, PeerInfo, RegisterRequest, RegisterResponse};
pub use device::UserspaceEngine;
pub use dialer::Dialer;
pub use error::{EngineError, Result};
pub use netmon::NetworkMonitor;
pub use netstack::Netstack;
pub use registry::Registry;
pub use store::FileStore;
pub use tun::TunDevice;

/// Default overlay control-plane URL, overridable through prefs.
pub const DEFAULT_CONTROL_URL: &str = "https://controlplane.tailscale.com";
