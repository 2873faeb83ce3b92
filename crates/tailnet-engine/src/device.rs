//! Userspace WireGuard engine bound to a host-namespace TUN link.
//!
//! The data plane is boringtun's device event loop, attached to the TUN by
//! name. Configuration (keys, peers, endpoints) is pushed by the backend
//! through the device's UAPI socket; this type owns only lifecycle.

use std::sync::Mutex;

use boringtun::device::{DeviceConfig, DeviceHandle};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::registry::Registry;
use crate::tun::TunDevice;
use crate::uapi::UapiClient;

pub struct UserspaceEngine {
    tun_name: String,
    uapi: UapiClient,
    device: Mutex<Option<DeviceHandle>>,
}

impl UserspaceEngine {
    /// Attach a WireGuard device to `tun` and register the engine.
    ///
    /// The device spawns its own event-loop threads; it exits when the
    /// handle is dropped or the TUN link is deleted.
    pub fn new(registry: &mut Registry, tun: &TunDevice) -> Result<std::sync::Arc<Self>> {
        let config = DeviceConfig::default();
        let handle = DeviceHandle::new(tun.name(), config)
            .map_err(|e| EngineError::Device(format!("{e:?}")))?;
        debug!(tun = tun.name(), "wireguard device attached");

        let engine = std::sync::Arc::new(Self {
            tun_name: tun.name().to_string(),
            uapi: UapiClient::for_interface(tun.name()),
            device: Mutex::new(Some(handle)),
        });
        registry.set_engine(engine.clone());
        Ok(engine)
    }

    pub fn tun_name(&self) -> &str {
        &self.tun_name
    }

    pub fn uapi(&self) -> &UapiClient {
        &self.uapi
    }

    /// Drop the device event loop. Idempotent; the TUN link itself is
    /// persistent and removed separately through netlink.
    pub fn close(&self) {
        let mut guard = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = guard.take() {
            drop(handle);
            debug!(tun = %self.tun_name, "wireguard device closed");
        }
    }
}

impl Drop for UserspaceEngine {
    fn drop(&mut self) {
        let guard = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            warn!(tun = %self.tun_name, "engine dropped without close()");
        }
    }
}
