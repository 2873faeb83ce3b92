//! Network-change monitor.
//!
//! Watches the host's default route interface and publishes changes on a
//! watch channel. The control connection re-resolves its path when the
//! default interface moves (laptop nodes, failover links); consumers that
//! only need lifecycle semantics just hold the handle and close it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct NetworkMonitor {
    token: CancellationToken,
    current: watch::Receiver<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(default_route_interface());

        let child = token.child_token();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                let iface = default_route_interface();
                if *tx.borrow() != iface {
                    debug!(iface = ?iface, "default route interface changed");
                    let _ = tx.send(iface);
                }
            }
        });

        Self {
            token,
            current: rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Name of the interface currently carrying the default route.
    pub fn default_interface(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Subscribe to interface-change notifications.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.current.clone()
    }

    /// Stop the monitor task. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Interface of the all-zero destination route, from `/proc/net/route`.
fn default_route_interface() -> Option<String> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let dest = fields.next()?;
        if dest == "00000000" {
            return Some(iface.to_string());
        }
    }
    None
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
