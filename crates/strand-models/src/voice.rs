use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snowflake::{self, Snowflake};

// Voice signaling opcodes
pub const VOICE_OP_IDENTIFY: u8 = 0;
pub const VOICE_OP_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_OP_READY: u8 = 2;
pub const VOICE_OP_HEARTBEAT: u8 = 3;
pub const VOICE_OP_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_OP_SPEAKING: u8 = 5;
pub const VOICE_OP_HEARTBEAT_ACK: u8 = 6;
pub const VOICE_OP_RESUME: u8 = 7;
pub const VOICE_OP_HELLO: u8 = 8;
pub const VOICE_OP_RESUMED: u8 = 9;
pub const VOICE_OP_CLIENT_DISCONNECT: u8 = 13;

/// Voice signaling envelope. Unlike the main gateway it carries no sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl VoiceMessage {
    pub fn new<T: Serialize>(op: u8, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(body)?,
        })
    }

    pub fn body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.d)
    }
}

/// Gateway-side voice state, as delivered by VOICE_STATE_UPDATE dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceState {
    #[serde(with = "snowflake::string")]
    pub user_id: Snowflake,
    #[serde(with = "snowflake::option", default)]
    pub channel_id: Option<Snowflake>,
    #[serde(with = "snowflake::option", default)]
    pub guild_id: Option<Snowflake>,
    pub session_id: String,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub suppress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceIdentify {
    #[serde(with = "snowflake::string")]
    pub server_id: Snowflake,
    #[serde(with = "snowflake::string")]
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceResume {
    #[serde(with = "snowflake::string")]
    pub server_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceHello {
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    #[serde(with = "snowflake::option", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Snowflake>,
    pub ssrc: u32,
    #[serde(default)]
    pub speaking: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    #[serde(with = "snowflake::string")]
    pub user_id: Snowflake,
}
