use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out opening connection")]
    ConnectTimeout,
    #[error("connection closed")]
    Closed,
    #[error("frame decode error: {0}")]
    Frame(#[from] crate::compression::FrameError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("shard already started")]
    AlreadyStarted,
    #[error("shard has shut down")]
    ShutDown,
    #[error("invalid configuration: {0}")]
    Config(String),
}
