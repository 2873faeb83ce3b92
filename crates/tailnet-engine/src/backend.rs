//! Local backend: the per-node control state machine.
//!
//! Start is not monolithic. After [`LocalBackend::start`] the backend is
//! either `Starting` (a persisted identity exists and reconnection is in
//! flight) or `NeedsLogin` (a fresh node, or one whose identity was never
//! registered). `NeedsLogin` is left by an explicit
//! [`LocalBackend::start_login_interactive`], which consumes the pending
//! auth key or re-registers the persisted node key. Callers observe progress
//! by polling [`LocalBackend::status`].

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::{ControlClient, RegisterRequest};
use crate::error::{EngineError, Result};
use crate::registry::Registry;
use crate::store::{FileStore, KEY_NODE_KEY, KEY_PROFILE};
use crate::uapi::{UapiClient, WgConfig, WgPeer};
use crate::DEFAULT_CONTROL_URL;

const WIREGUARD_KEEPALIVE_SECS: u16 = 25;

/// Coarse backend state, reported by CHECK and the status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    NoState,
    NeedsLogin,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoState => f.write_str("NoState"),
            Self::NeedsLogin => f.write_str("NeedsLogin"),
            Self::Starting => f.write_str("Starting"),
            Self::Running => f.write_str("Running"),
            Self::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Preferences applied at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefs {
    pub hostname: String,
    pub want_running: bool,
    pub control_url: String,
}

impl Prefs {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            want_running: true,
            control_url: DEFAULT_CONTROL_URL.to_string(),
        }
    }
}

/// Options for [`LocalBackend::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// One-shot preauthorization key. Supplied on first Add, absent on
    /// recovery (the persisted identity is reused instead).
    pub auth_key: Option<String>,
    pub prefs: Prefs,
}

/// Snapshot of backend state and assigned overlay addresses.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: BackendState,
    pub addresses: Vec<IpAddr>,
}

impl NodeStatus {
    pub fn ipv4(&self) -> Option<std::net::Ipv4Addr> {
        self.addresses.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn ipv6(&self) -> Option<std::net::Ipv6Addr> {
        self.addresses.iter().find_map(|ip| match ip {
            IpAddr::V4(_) => None,
            IpAddr::V6(v6) => Some(*v6),
        })
    }
}

/// Persisted login profile, rewritten after every successful registration.
#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    hostname: String,
    addresses: Vec<String>,
}

struct Inner {
    state: BackendState,
    prefs: Option<Prefs>,
    auth_key: Option<String>,
    addresses: Vec<IpAddr>,
    login_task: Option<JoinHandle<()>>,
}

pub struct LocalBackend {
    store: Arc<FileStore>,
    control: Arc<dyn ControlClient>,
    uapi: UapiClient,
    inner: Mutex<Inner>,
}

impl LocalBackend {
    /// Bind a backend to the registry's store, control client and engine.
    pub fn new(registry: &Registry) -> Result<Arc<Self>> {
        let uapi = registry.engine()?.uapi().clone();
        Ok(Arc::new(Self::with_parts(
            registry.store()?,
            registry.control()?,
            uapi,
        )))
    }

    fn with_parts(
        store: Arc<FileStore>,
        control: Arc<dyn ControlClient>,
        uapi: UapiClient,
    ) -> Self {
        Self {
            store,
            control,
            uapi,
            inner: Mutex::new(Inner {
                state: BackendState::NoState,
                prefs: None,
                auth_key: None,
                addresses: Vec::new(),
                login_task: None,
            }),
        }
    }

    /// Start the backend with the given preferences.
    ///
    /// With a persisted profile the backend reconnects in the background and
    /// moves to `Starting`; otherwise it parks in `NeedsLogin` until
    /// [`Self::start_login_interactive`] is driven.
    pub fn start(self: &Arc<Self>, opts: StartOptions) -> Result<()> {
        self.ensure_node_key()?;

        let has_profile = self.store.get(KEY_PROFILE).is_some();
        let mut inner = self.lock();
        if inner.state == BackendState::Stopped {
            return Err(EngineError::ShutDown);
        }
        inner.prefs = Some(opts.prefs);
        inner.auth_key = opts.auth_key;

        if has_profile {
            inner.state = BackendState::Starting;
            let task = tokio::spawn(self.clone().run_login(None));
            inner.login_task = Some(task);
        } else {
            inner.state = BackendState::NeedsLogin;
        }
        Ok(())
    }

    /// Drive a login, consuming the pending auth key if one was supplied and
    /// reusing the persisted node key otherwise.
    pub fn start_login_interactive(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BackendState::Stopped => return Err(EngineError::ShutDown),
            BackendState::Starting | BackendState::Running => return Ok(()),
            _ => {}
        }
        let auth_key = inner.auth_key.take();
        inner.state = BackendState::Starting;
        let task = tokio::spawn(self.clone().run_login(auth_key));
        inner.login_task = Some(task);
        Ok(())
    }

    pub fn state(&self) -> BackendState {
        self.lock().state
    }

    pub fn status(&self) -> NodeStatus {
        let inner = self.lock();
        NodeStatus {
            state: inner.state,
            addresses: inner.addresses.clone(),
        }
    }

    /// Stop the backend and abort any in-flight login. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.state = BackendState::Stopped;
        if let Some(task) = inner.login_task.take() {
            task.abort();
        }
    }

    async fn run_login(self: Arc<Self>, auth_key: Option<String>) {
        match self.connect(auth_key).await {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "overlay login failed");
                let mut inner = self.lock();
                if inner.state != BackendState::Stopped {
                    inner.state = BackendState::NeedsLogin;
                }
            }
        }
    }

    /// Register with the control plane and push the resulting configuration
    /// into the WireGuard device.
    async fn connect(&self, auth_key: Option<String>) -> Result<()> {
        let (hostname, secret) = {
            let inner = self.lock();
            let prefs = inner
                .prefs
                .as_ref()
                .ok_or(EngineError::MissingSubsystem("prefs"))?;
            (prefs.hostname.clone(), self.ensure_node_key()?)
        };

        let node_key = hex::encode(PublicKey::from(&secret).as_bytes());
        let resp = self
            .control
            .register_node(&RegisterRequest {
                node_key,
                hostname: hostname.clone(),
                auth_key,
            })
            .await?;

        let addresses = parse_addresses(&resp.addresses)?;

        let config = WgConfig {
            private_key: hex::encode(secret.to_bytes()),
            listen_port: 0,
            replace_peers: true,
            peers: resp
                .peers
                .iter()
                .map(|p| WgPeer {
                    public_key: p.public_key.clone(),
                    endpoint: p.endpoint.clone(),
                    allowed_ips: p.allowed_ips.clone(),
                    persistent_keepalive: Some(WIREGUARD_KEEPALIVE_SECS),
                })
                .collect(),
        };
        self.uapi.apply(&config).await?;

        let profile = Profile {
            hostname,
            addresses: resp.addresses.clone(),
        };
        self.store.set(KEY_PROFILE, &serde_json::to_string(&profile)?)?;

        let mut inner = self.lock();
        if inner.state == BackendState::Stopped {
            return Ok(());
        }
        inner.addresses = addresses;
        inner.state = BackendState::Running;
        info!(addresses = ?inner.addresses, "overlay node running");
        Ok(())
    }

    /// Load the node's private key, generating and persisting one on first use.
    fn ensure_node_key(&self) -> Result<StaticSecret> {
        if let Some(hex_key) = self.store.get(KEY_NODE_KEY) {
            let bytes = hex::decode(&hex_key)
                .map_err(|_| EngineError::InvalidAddress(hex_key.clone()))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| EngineError::InvalidAddress(hex_key))?;
            return Ok(StaticSecret::from(arr));
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        self.store
            .set(KEY_NODE_KEY, &hex::encode(secret.to_bytes()))?;
        Ok(secret)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse control-plane address CIDRs into bare addresses.
fn parse_addresses(cidrs: &[String]) -> Result<Vec<IpAddr>> {
    cidrs
        .iter()
        .map(|cidr| {
            let addr = cidr.split('/').next().unwrap_or(cidr);
            addr.parse::<IpAddr>()
                .map_err(|_| EngineError::InvalidAddress(cidr.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    struct FakeControl {
        addresses: Vec<String>,
        calls: AtomicUsize,
        saw_auth_key: Mutex<Vec<bool>>,
    }

    impl FakeControl {
        fn new(addresses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                saw_auth_key: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ControlClient for FakeControl {
        async fn register_node(
            &self,
            req: &RegisterRequest,
        ) -> Result<crate::control::RegisterResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_auth_key
                .lock()
                .unwrap()
                .push(req.auth_key.is_some());
            Ok(crate::control::RegisterResponse {
                addresses: self.addresses.clone(),
                peers: vec![],
            })
        }
    }

    /// Serve errno=0 to every UAPI request at `path`.
    fn spawn_fake_uapi(path: std::path::PathBuf) {
        let listener = {
            let _ = std::fs::remove_file(&path);
            UnixListener::bind(&path).unwrap()
        };
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut req = String::new();
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                req.push_str(&String::from_utf8_lossy(&buf[..n]));
                                if req.ends_with("\n\n") {
                                    let _ = stream.write_all(b"errno=0\n\n").await;
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
    }

    fn backend_with(
        dir: &tempfile::TempDir,
        control: Arc<dyn ControlClient>,
    ) -> Arc<LocalBackend> {
        let store = FileStore::load_or_create(dir.path().join("engine.state")).unwrap();
        let uapi_path = dir.path().join("wg.sock");
        spawn_fake_uapi(uapi_path.clone());
        let uapi = UapiClient::for_socket_path(uapi_path);
        Arc::new(LocalBackend::with_parts(store, control, uapi))
    }

    async fn wait_for_state(backend: &LocalBackend, want: BackendState) {
        for _ in 0..100 {
            if backend.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend never reached {want}, stuck in {}", backend.state());
    }

    #[tokio::test]
    async fn fresh_start_needs_login() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with(&dir, FakeControl::new(&["100.64.0.5/32"]));

        backend
            .start(StartOptions {
                auth_key: Some("tskey-auth-x".into()),
                prefs: Prefs::new("k8s-default-web"),
            })
            .unwrap();
        assert_eq!(backend.state(), BackendState::NeedsLogin);
    }

    #[tokio::test]
    async fn interactive_login_consumes_auth_key_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let control = FakeControl::new(&["100.64.0.5/32", "fd7a:115c:a1e0::5/128"]);
        let backend = backend_with(&dir, control.clone());

        backend
            .start(StartOptions {
                auth_key: Some("tskey-auth-x".into()),
                prefs: Prefs::new("k8s-default-web"),
            })
            .unwrap();
        backend.start_login_interactive().unwrap();
        wait_for_state(&backend, BackendState::Running).await;

        let status = backend.status();
        assert_eq!(status.ipv4().unwrap().to_string(), "100.64.0.5");
        assert_eq!(status.ipv6().unwrap().to_string(), "fd7a:115c:a1e0::5");
        assert_eq!(control.saw_auth_key.lock().unwrap().as_slice(), &[true]);
    }

    #[tokio::test]
    async fn restart_reuses_identity_without_auth_key() {
        let dir = tempfile::tempdir().unwrap();
        let control = FakeControl::new(&["100.64.0.5/32"]);

        let first_key;
        {
            let backend = backend_with(&dir, control.clone());
            backend
                .start(StartOptions {
                    auth_key: Some("tskey-auth-x".into()),
                    prefs: Prefs::new("k8s-default-web"),
                })
                .unwrap();
            backend.start_login_interactive().unwrap();
            wait_for_state(&backend, BackendState::Running).await;
            first_key = backend.store.get(KEY_NODE_KEY).unwrap();
            backend.shutdown();
        }

        // Same state directory: the profile and node key persist.
        let backend = backend_with(&dir, control.clone());
        backend
            .start(StartOptions {
                auth_key: None,
                prefs: Prefs::new("k8s-default-web"),
            })
            .unwrap();
        wait_for_state(&backend, BackendState::Running).await;

        assert_eq!(backend.store.get(KEY_NODE_KEY).unwrap(), first_key);
        // Second registration carried no auth key.
        assert_eq!(
            control.saw_auth_key.lock().unwrap().as_slice(),
            &[true, false]
        );
    }

    #[tokio::test]
    async fn failed_login_returns_to_needs_login() {
        struct FailingControl;
        #[async_trait]
        impl ControlClient for FailingControl {
            async fn register_node(
                &self,
                _req: &RegisterRequest,
            ) -> Result<crate::control::RegisterResponse> {
                Err(EngineError::Control {
                    status: 401,
                    body: "bad key".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with(&dir, Arc::new(FailingControl));
        backend
            .start(StartOptions {
                auth_key: Some("tskey-auth-x".into()),
                prefs: Prefs::new("h"),
            })
            .unwrap();
        backend.start_login_interactive().unwrap();
        wait_for_state(&backend, BackendState::NeedsLogin).await;
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with(&dir, FakeControl::new(&["100.64.0.5/32"]));
        backend.shutdown();
        backend.shutdown();
        assert!(matches!(
            backend
                .start(StartOptions {
                    auth_key: None,
                    prefs: Prefs::new("h"),
                })
                .unwrap_err(),
            EngineError::ShutDown
        ));
    }

    #[test]
    fn parse_addresses_strips_prefixes() {
        let addrs =
            parse_addresses(&["100.64.0.7/32".into(), "fd7a:115c:a1e0::7/128".into()]).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "100.64.0.7");
    }

    #[test]
    fn parse_addresses_rejects_garbage() {
        assert!(parse_addresses(&["not-an-ip/32".into()]).is_err());
    }
}
