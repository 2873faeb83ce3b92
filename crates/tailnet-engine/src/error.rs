#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("subsystem not registered: {0}")]
    MissingSubsystem(&'static str),

    #[error("creating TUN device: {0}")]
    Tun(std::io::Error),

    #[error("wireguard device: {0}")]
    Device(String),

    #[error("uapi: {0}")]
    Uapi(String),

    #[error("control plane returned status {status}: {body}")]
    Control { status: u16, body: String },

    #[error("control plane request: {0}")]
    ControlTransport(#[from] reqwest::Error),

    #[error("state store: {0}")]
    Store(std::io::Error),

    #[error("invalid overlay address {0:?}")]
    InvalidAddress(String),

    #[error("backend is shut down")]
    ShutDown,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
