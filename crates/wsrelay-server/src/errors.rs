//! Error types for channels and server startup.

use thiserror::Error;

/// Errors raised by a frame channel or while opening one.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// `send` was called while the channel was not open.
    #[error("channel is not open")]
    NotOpen,
    /// Socket, TLS or protocol failure on an established transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer refused the WebSocket handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),
    /// The outbound request could not be built.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl ChannelError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotOpen => "not_open",
            Self::Transport(_) => "transport",
            Self::Handshake(_) => "handshake",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<axum::Error> for ChannelError {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => Self::Handshake(format!("upstream answered {}", response.status())),
            WsError::HttpFormat(e) => Self::InvalidRequest(e.to_string()),
            WsError::Url(e) => Self::InvalidRequest(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket bind/accept failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Settings failed to load or validate.
    #[error(transparent)]
    Settings(#[from] wsrelay_settings::SettingsError),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
    /// The upstream URL could not be turned into a request.
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, RelayError>;
