//! Typed subsystem registry.
//!
//! The engine's parts are constructed in a fixed order but reference each
//! other cyclically at runtime. Each constructor takes `&mut Registry`,
//! inserts its product, and later consumers fetch what they need. A missing
//! subsystem is a construction-order bug and surfaces as
//! [`EngineError::MissingSubsystem`].

use std::sync::Arc;

use crate::control::ControlClient;
use crate::device::UserspaceEngine;
use crate::dialer::Dialer;
use crate::error::{EngineError, Result};
use crate::netmon::NetworkMonitor;
use crate::netstack::Netstack;
use crate::store::FileStore;

#[derive(Default)]
pub struct Registry {
    dialer: Option<Arc<Dialer>>,
    netmon: Option<Arc<NetworkMonitor>>,
    engine: Option<Arc<UserspaceEngine>>,
    netstack: Option<Arc<Netstack>>,
    store: Option<Arc<FileStore>>,
    control: Option<Arc<dyn ControlClient>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dialer(&mut self, dialer: Arc<Dialer>) {
        self.dialer = Some(dialer);
    }

    pub fn dialer(&self) -> Result<Arc<Dialer>> {
        self.dialer
            .clone()
            .ok_or(EngineError::MissingSubsystem("dialer"))
    }

    pub fn set_netmon(&mut self, netmon: Arc<NetworkMonitor>) {
        self.netmon = Some(netmon);
    }

    pub fn netmon(&self) -> Result<Arc<NetworkMonitor>> {
        self.netmon
            .clone()
            .ok_or(EngineError::MissingSubsystem("netmon"))
    }

    pub fn set_engine(&mut self, engine: Arc<UserspaceEngine>) {
        self.engine = Some(engine);
    }

    pub fn engine(&self) -> Result<Arc<UserspaceEngine>> {
        self.engine
            .clone()
            .ok_or(EngineError::MissingSubsystem("engine"))
    }

    pub fn set_netstack(&mut self, netstack: Arc<Netstack>) {
        self.netstack = Some(netstack);
    }

    pub fn netstack(&self) -> Result<Arc<Netstack>> {
        self.netstack
            .clone()
            .ok_or(EngineError::MissingSubsystem("netstack"))
    }

    pub fn set_store(&mut self, store: Arc<FileStore>) {
        self.store = Some(store);
    }

    pub fn store(&self) -> Result<Arc<FileStore>> {
        self.store
            .clone()
            .ok_or(EngineError::MissingSubsystem("store"))
    }

    pub fn set_control(&mut self, control: Arc<dyn ControlClient>) {
        self.control = Some(control);
    }

    pub fn control(&self) -> Result<Arc<dyn ControlClient>> {
        self.control
            .clone()
            .ok_or(EngineError::MissingSubsystem("control"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_subsystem_is_an_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.store().unwrap_err(),
            EngineError::MissingSubsystem("store")
        ));
    }

    #[test]
    fn set_then_get() {
        let mut registry = Registry::new();
        let dialer = Arc::new(Dialer::new().unwrap());
        registry.set_dialer(dialer.clone());
        assert!(Arc::ptr_eq(&registry.dialer().unwrap(), &dialer));
    }
}
