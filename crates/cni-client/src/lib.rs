//! Client side of the tailnet-cni daemon socket.
//!
//! Connects to the daemon's Unix socket with exponential backoff (pods can
//! be scheduled before the daemon is ready), then issues sequence-matched
//! request/response exchanges using the `cni-proto` framing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};
use tracing::debug;

use cni_proto::{
    AddRequest, AddResponse, CheckResponse, Decoder, PodRef, RawMessage, MSG_ADD, MSG_ADD_OK,
    MSG_CHECK, MSG_CHECK_OK, MSG_DEL, MSG_DEL_OK, MSG_ERROR,
};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Connection retry policy: the daemon may not be up yet when the runtime
/// invokes the plugin.
const MAX_CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Backoff cap while the socket path does not exist.
const CONNECT_CAP_ABSENT: Duration = Duration::from_secs(10);
/// Backoff cap when the socket exists but refuses connections.
const CONNECT_CAP_PRESENT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connecting to daemon at {path} after {attempts} attempts: {source}")]
    Connect {
        path: PathBuf,
        attempts: u32,
        source: io::Error,
    },

    #[error("daemon returned error: {0}")]
    Daemon(String),

    #[error("unexpected response type {0:#04x}")]
    UnexpectedResponse(u8),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Proto(#[from] cni_proto::ProtoError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A connected daemon client.
pub struct DaemonClient {
    stream: UnixStream,
    decoder: Decoder,
    next_seq: u32,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl DaemonClient {
    /// Connect to the daemon socket, retrying with exponential backoff.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "not attempted");

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    debug!(path = %socket_path.display(), attempt, "connected to daemon");
                    return Ok(Self {
                        stream,
                        decoder: Decoder::new(),
                        next_seq: 1,
                        read_buf: Box::new([0u8; READ_BUF_SIZE]),
                    });
                }
                Err(e) => last_err = e,
            }

            if attempt + 1 == MAX_CONNECT_ATTEMPTS {
                break;
            }

            // A missing socket means the daemon has not started: back off
            // longer than for a present-but-unresponsive socket.
            let cap = if socket_path.exists() {
                CONNECT_CAP_PRESENT
            } else {
                CONNECT_CAP_ABSENT
            };
            let delay = CONNECT_BASE_DELAY
                .saturating_mul(1u32 << attempt.min(10))
                .min(cap);
            time::sleep(delay).await;
        }

        Err(ClientError::Connect {
            path: socket_path.to_path_buf(),
            attempts: MAX_CONNECT_ATTEMPTS,
            source: last_err,
        })
    }

    /// Issue an ADD and wait for the overlay assignment.
    pub async fn add(&mut self, req: &AddRequest, deadline: Duration) -> Result<AddResponse> {
        let payload = cni_proto::encode_add(req)?;
        let resp = self.request(MSG_ADD, &payload, deadline).await?;
        match resp.msg_type {
            MSG_ADD_OK => Ok(cni_proto::decode_add_ok(&resp.payload)?),
            other => Err(self.into_error(other, &resp.payload)),
        }
    }

    /// Issue a DEL. The daemon answers success even for unknown containers.
    pub async fn delete(&mut self, r: &PodRef, deadline: Duration) -> Result<()> {
        let payload = cni_proto::encode_pod_ref(r)?;
        let resp = self.request(MSG_DEL, &payload, deadline).await?;
        match resp.msg_type {
            MSG_DEL_OK => Ok(()),
            other => Err(self.into_error(other, &resp.payload)),
        }
    }

    /// Issue a CHECK and return the daemon's health verdict.
    pub async fn check(&mut self, r: &PodRef, deadline: Duration) -> Result<CheckResponse> {
        let payload = cni_proto::encode_pod_ref(r)?;
        let resp = self.request(MSG_CHECK, &payload, deadline).await?;
        match resp.msg_type {
            MSG_CHECK_OK => Ok(cni_proto::decode_check_ok(&resp.payload)?),
            other => Err(self.into_error(other, &resp.payload)),
        }
    }

    fn into_error(&self, msg_type: u8, payload: &[u8]) -> ClientError {
        if msg_type == MSG_ERROR {
            match cni_proto::decode_error(payload) {
                Ok(msg) => ClientError::Daemon(msg),
                Err(e) => ClientError::Proto(e),
            }
        } else {
            ClientError::UnexpectedResponse(msg_type)
        }
    }

    /// Send a request and wait for the response with a matching sequence number.
    async fn request(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<RawMessage> {
        let seq = self.next_seq();
        let frame = cni_proto::encode(msg_type, seq, payload)?;
        self.stream.write_all(&frame).await?;

        let until = Instant::now() + deadline;
        loop {
            let n = time::timeout_at(until, self.stream.read(self.read_buf.as_mut()))
                .await
                .map_err(|_| ClientError::Timeout(deadline))??;
            if n == 0 {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "daemon closed connection",
                )));
            }
            let messages = self.decoder.decode(self.read_buf.get(..n).unwrap_or_default())?;
            for msg in messages {
                if msg.seq == seq {
                    return Ok(msg);
                }
            }
        }
    }

    /// Next sequence number, wrapping and skipping 0.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        seq
    }
}
