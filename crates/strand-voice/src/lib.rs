pub mod config;
pub mod connection;
pub mod crypto;
pub mod decode;
pub mod error;
pub mod handler;
pub mod jitter;
pub mod mixer;
pub mod packet;
pub mod session;
pub mod signaling;
pub mod ssrc;

pub use config::VoiceConfig;
pub use connection::{CloseReason, RelayState, TransportReady, VoiceRelay};
pub use decode::{AudioDecoder, PcmDecoder};
pub use error::VoiceError;
pub use handler::{AudioReceiveHandler, ParticipantDirectory};
pub use mixer::CombinedAudio;
pub use session::VoiceSessionInfo;
pub use ssrc::SsrcTable;
