#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("{0}")]
    Config(String),

    #[error("unsupported cniVersion {0:?}")]
    Version(String),

    #[error("{0}")]
    Args(String),

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error(transparent)]
    Client(#[from] cni_client::ClientError),

    #[error("unhealthy: {0}")]
    Unhealthy(String),
}

impl PluginError {
    /// Well-known CNI error code for this failure.
    pub fn code(&self) -> u32 {
        match self {
            Self::Version(_) => 1,
            Self::Config(_) => 7,
            Self::Args(_) | Self::MissingEnv(_) => 4,
            Self::Client(_) => 11,
            Self::Unhealthy(_) => 11,
        }
    }
}
