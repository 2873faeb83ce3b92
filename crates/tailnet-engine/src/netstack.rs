//! Userspace IP stack shim.
//!
//! The engine requires an IP stack for node-local traffic handling, but in
//! this deployment both local-IP and subnet processing are disabled: pod
//! traffic is carried by kernel routing between the veth pair and the TUN
//! link. The netstack therefore participates in lifecycle only — it must be
//! constructed, started against the backend, and closed during unwind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::sync::Mutex;

use crate::backend::LocalBackend;
use crate::error::{EngineError, Result};
use crate::registry::Registry;

pub struct Netstack {
    process_local_ips: AtomicBool,
    process_subnets: AtomicBool,
    started: AtomicBool,
    backend: Mutex<Weak<LocalBackend>>,
}

impl Netstack {
    /// Build the netstack over the already-registered engine.
    pub fn create(registry: &mut Registry) -> Result<Arc<Self>> {
        // The engine must exist first; packet service would attach to it.
        registry.engine()?;
        let ns = Arc::new(Self {
            process_local_ips: AtomicBool::new(true),
            process_subnets: AtomicBool::new(true),
            started: AtomicBool::new(false),
            backend: Mutex::new(Weak::new()),
        });
        registry.set_netstack(ns.clone());
        Ok(ns)
    }

    pub fn set_processing(&self, local_ips: bool, subnets: bool) {
        self.process_local_ips.store(local_ips, Ordering::Release);
        self.process_subnets.store(subnets, Ordering::Release);
    }

    pub fn processes_local_ips(&self) -> bool {
        self.process_local_ips.load(Ordering::Acquire)
    }

    pub fn processes_subnets(&self) -> bool {
        self.process_subnets.load(Ordering::Acquire)
    }

    /// Bind the netstack to its backend and start it.
    pub fn start(&self, backend: &Arc<LocalBackend>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Device("netstack already started".into()));
        }
        *self.backend.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(backend);
        Ok(())
    }

    pub fn close(&self) {
        self.started.store(false, Ordering::Release);
        *self.backend.lock().unwrap_or_else(|e| e.into_inner()) = Weak::new();
    }
}
