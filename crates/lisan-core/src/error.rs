use thiserror::Error;

#[derive(Debug, Error)]
pub enum LisanError {
    #[error("Config error: {0}")]
    Config(String),

    /// Token backend unreachable, non-2xx, or no usable secret in the body.
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// SDP offer/answer exchange failed.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Event channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Malformed inbound event.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session start cancelled")]
    Cancelled,

    #[error("Session already stopped; create a new session to start again")]
    SessionTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LisanError {
    /// Short machine-readable kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Credential(_) => "credential",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::Negotiation(_) => "negotiation",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::Protocol(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Cancelled => "cancelled",
            Self::SessionTerminated => "session_terminated",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, LisanError>;
