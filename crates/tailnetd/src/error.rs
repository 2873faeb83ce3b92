use crate::netlink::NetlinkError;
use crate::netns::NetnsError;
use crate::oauth::OauthError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("minting auth key: {0}")]
    Oauth(#[from] OauthError),

    #[error("engine: {0}")]
    Engine(#[from] tailnet_engine::EngineError),

    #[error(transparent)]
    Netlink(#[from] NetlinkError),

    #[error(transparent)]
    Netns(#[from] NetnsError),

    #[error("an add for container {0} is already in flight")]
    PodBusy(String),

    #[error("timeout waiting for overlay address (state: {state})")]
    AddressTimeout { state: String },

    #[error("engine reported no IPv4 overlay address")]
    MissingAddress,

    #[error("pod metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid pod record: {0}")]
    InvalidRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
