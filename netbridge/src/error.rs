use thiserror::Error;

/// Errors surfaced by the tunnel library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("websocket transport failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to dial {url} after {attempts} attempts: {source}")]
    Dial {
        url: String,
        attempts: u32,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("inconsistent chunk {index}/{total} for message {id}")]
    Chunk { id: String, index: u32, total: u32 },

    #[error("session is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Terminal outcome of waiting on a correlated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("request cancelled")]
    Cancelled,
    #[error("session disconnected")]
    Disconnected,
}
