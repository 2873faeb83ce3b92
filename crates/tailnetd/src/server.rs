//! RPC surface: a Unix stream socket speaking the `cni-proto` framing.
//!
//! One task per connection; requests on a connection are answered in order.
//! Each operation runs under its own deadline so a wedged Add cannot hold a
//! connection forever. Errors are answered as `MSG_ERROR` frames — the
//! transport stays up.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cni_proto::{
    AddResponse, CheckResponse, Decoder, RawMessage, MSG_ADD, MSG_ADD_OK, MSG_CHECK, MSG_CHECK_OK,
    MSG_DEL, MSG_DEL_OK, MSG_ERROR,
};

use crate::pods::{AddArgs, PodManager};

/// Per-operation deadlines, matching the plugin's client-side timeouts.
const ADD_DEADLINE: Duration = Duration::from_secs(120);
const DEL_DEADLINE: Duration = Duration::from_secs(30);
const CHECK_DEADLINE: Duration = Duration::from_secs(10);

const READ_BUF_SIZE: usize = 16 * 1024;

pub struct Server {
    socket_path: PathBuf,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind the daemon socket (directory `0755`, socket `0660`) and start
    /// accepting connections.
    pub fn start(socket_path: &Path, pods: Arc<PodManager>) -> io::Result<Self> {
        if let Some(dir) = socket_path.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)?;
        }
        match fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o660))?;

        info!(path = %socket_path.display(), "rpc server listening");

        let shutdown = CancellationToken::new();
        let accept_token = shutdown.child_token();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let pods = pods.clone();
                            let conn_token = accept_token.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, pods, conn_token).await {
                                    debug!(error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            return;
                        }
                    },
                }
            }
        });

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            shutdown,
            accept_task,
        })
    }

    /// Stop accepting, drop in-flight connections, remove the socket file.
    pub async fn stop(self) {
        info!("stopping rpc server");
        self.shutdown.cancel();
        let _ = self.accept_task.await;
        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove socket file");
            }
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    pods: Arc<PodManager>,
    token: CancellationToken,
) -> io::Result<()> {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        let messages = decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        for msg in messages {
            let reply = handle_message(&pods, &msg).await;
            stream.write_all(&reply).await?;
        }
    }
}

/// Dispatch one request and render the response frame.
///
/// Add and Delete mutate registry and kernel state, so they run as detached
/// tasks: when a deadline fires the operation still runs to completion —
/// either installing the pod (the runtime's retry then finds it) or
/// unwinding cleanly. Dropping them mid-flight would strand a half-built
/// pod.
async fn handle_message(pods: &Arc<PodManager>, msg: &RawMessage) -> Vec<u8> {
    let seq = msg.seq;
    match msg.msg_type {
        MSG_ADD => match cni_proto::decode_add(&msg.payload) {
            Ok(req) => {
                info!(
                    container = %req.container_id,
                    namespace = %req.pod_namespace, pod = %req.pod_name,
                    netns = %req.netns,
                    "ADD"
                );
                let args = AddArgs {
                    container_id: req.container_id.clone(),
                    netns_path: req.netns.clone(),
                    // eth0 is the primary CNI's; the overlay interface has
                    // a fixed name inside the pod.
                    ifname: crate::bridge::POD_IFNAME.to_string(),
                    pod_name: req.pod_name.clone(),
                    namespace: req.pod_namespace.clone(),
                    cluster_ip: req.cluster_ip.clone(),
                };
                let add_task = tokio::spawn({
                    let pods = pods.clone();
                    async move { pods.add(args).await }
                });
                match tokio::time::timeout(ADD_DEADLINE, add_task).await {
                    Ok(Err(join_err)) => {
                        error!(container = %req.container_id, error = %join_err, "ADD task failed");
                        error_frame(seq, "adding pod: internal failure")
                    }
                    Ok(Ok(Ok(pod))) => {
                        info!(
                            container = %req.container_id,
                            address = %pod.overlay_ipv4,
                            hostname = %pod.hostname,
                            "ADD succeeded"
                        );
                        let resp = AddResponse {
                            ipv4: pod.overlay_ipv4.to_string(),
                            ipv6: pod
                                .overlay_ipv6
                                .map(|ip| ip.to_string())
                                .unwrap_or_default(),
                            hostname: pod.hostname.clone(),
                        };
                        encode_or_error(MSG_ADD_OK, seq, cni_proto::encode_add_ok(&resp))
                    }
                    Ok(Ok(Err(e))) => {
                        error!(container = %req.container_id, error = %e, "ADD failed");
                        error_frame(seq, &format!("adding pod: {e}"))
                    }
                    Err(_) => {
                        // The detached task keeps going: it will finish or
                        // unwind on its own.
                        error!(container = %req.container_id, "ADD deadline exceeded");
                        error_frame(seq, "adding pod: deadline exceeded")
                    }
                }
            }
            Err(e) => error_frame(seq, &format!("malformed add request: {e}")),
        },

        MSG_DEL => match cni_proto::decode_pod_ref(&msg.payload) {
            Ok(req) => {
                info!(container = %req.container_id, "DEL");
                let del_task = tokio::spawn({
                    let pods = pods.clone();
                    let container_id = req.container_id.clone();
                    async move { pods.delete(&container_id).await }
                });
                match tokio::time::timeout(DEL_DEADLINE, del_task).await {
                    Ok(Err(join_err)) => {
                        error!(container = %req.container_id, error = %join_err, "DEL task failed");
                        error_frame(seq, "deleting pod: internal failure")
                    }
                    Ok(Ok(Ok(()))) => encode_or_error(MSG_DEL_OK, seq, Ok(Vec::new())),
                    Ok(Ok(Err(e))) => {
                        error!(container = %req.container_id, error = %e, "DEL failed");
                        error_frame(seq, &format!("deleting pod: {e}"))
                    }
                    Err(_) => error_frame(seq, "deleting pod: deadline exceeded"),
                }
            }
            Err(e) => error_frame(seq, &format!("malformed del request: {e}")),
        },

        MSG_CHECK => match cni_proto::decode_pod_ref(&msg.payload) {
            Ok(req) => {
                debug!(container = %req.container_id, "CHECK");
                match tokio::time::timeout(CHECK_DEADLINE, pods.check(&req.container_id)).await {
                    Ok((healthy, message)) => encode_or_error(
                        MSG_CHECK_OK,
                        seq,
                        cni_proto::encode_check_ok(&CheckResponse { healthy, message }),
                    ),
                    Err(_) => error_frame(seq, "checking pod: deadline exceeded"),
                }
            }
            Err(e) => error_frame(seq, &format!("malformed check request: {e}")),
        },

        other => error_frame(seq, &format!("unknown message type {other:#04x}")),
    }
}

fn encode_or_error(
    msg_type: u8,
    seq: u32,
    payload: Result<Vec<u8>, cni_proto::ProtoError>,
) -> Vec<u8> {
    match payload.and_then(|p| cni_proto::encode(msg_type, seq, &p)) {
        Ok(frame) => frame,
        Err(e) => error_frame(seq, &format!("encoding response: {e}")),
    }
}

fn error_frame(seq: u32, message: &str) -> Vec<u8> {
    let payload = cni_proto::encode_error(message);
    // A fixed-size error about an error cannot itself overflow the frame.
    cni_proto::encode(MSG_ERROR, seq, &payload).unwrap_or_default()
}
