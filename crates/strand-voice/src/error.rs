use thiserror::Error;

use crate::connection::CloseReason;
use crate::crypto::CryptoError;
use crate::packet::PacketError;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("gateway error: {0}")]
    Gateway(#[from] strand_gateway::GatewayError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("voice session is missing {0}")]
    MissingField(&'static str),
    #[error("voice events belong to different guilds")]
    GuildMismatch,
    #[error("ip discovery timed out")]
    DiscoveryTimeout,
    #[error("relay already started")]
    AlreadyStarted,
    #[error("relay closed: {0}")]
    Closed(CloseReason),
}
