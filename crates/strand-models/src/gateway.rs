use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snowflake::{self, Snowflake};

/// Gateway opcodes. Unknown values are preserved so a newer server does not
/// break decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OpCode {
    // Server -> Client
    Dispatch,
    Reconnect,
    InvalidSession,
    Hello,
    HeartbeatAck,
    // Both directions
    Heartbeat,
    // Client -> Server
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    RequestGuildMembers,
    GuildSync,
    Other(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            12 => OpCode::GuildSync,
            other => OpCode::Other(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::PresenceUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
            OpCode::GuildSync => 12,
            OpCode::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    /// Build an outbound payload from a typed body.
    pub fn command<T: Serialize>(op: OpCode, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: Some(serde_json::to_value(body)?),
            s: None,
            t: None,
        })
    }

    /// Heartbeat carrying the last seen sequence, `null` before the first dispatch.
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat,
            d: Some(sequence.map(Value::from).unwrap_or(Value::Null)),
            s: None,
            t: None,
        }
    }

    pub fn dispatch(event_type: &str, sequence: Option<u64>, d: Value) -> Self {
        Self {
            op: OpCode::Dispatch,
            d: Some(d),
            s: sequence,
            t: Some(event_type.to_string()),
        }
    }

    /// Deserialize the body into a typed record.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.d.as_ref().unwrap_or(&Value::Null))
    }

    pub fn event_type(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";
pub const EVENT_RESUMED: &str = "RESUMED";

// Guild events
pub const EVENT_GUILD_CREATE: &str = "GUILD_CREATE";
pub const EVENT_GUILD_UPDATE: &str = "GUILD_UPDATE";
pub const EVENT_GUILD_DELETE: &str = "GUILD_DELETE";
pub const EVENT_GUILD_SYNC: &str = "GUILD_SYNC";
pub const EVENT_GUILD_MEMBER_ADD: &str = "GUILD_MEMBER_ADD";
pub const EVENT_GUILD_MEMBER_REMOVE: &str = "GUILD_MEMBER_REMOVE";
pub const EVENT_GUILD_MEMBER_UPDATE: &str = "GUILD_MEMBER_UPDATE";
pub const EVENT_GUILD_MEMBERS_CHUNK: &str = "GUILD_MEMBERS_CHUNK";

// Channel events
pub const EVENT_CHANNEL_CREATE: &str = "CHANNEL_CREATE";
pub const EVENT_CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
pub const EVENT_CHANNEL_DELETE: &str = "CHANNEL_DELETE";

// Message events
pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const EVENT_MESSAGE_DELETE: &str = "MESSAGE_DELETE";

// Presence and typing
pub const EVENT_PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
pub const EVENT_PRESENCES_REPLACE: &str = "PRESENCES_REPLACE";
pub const EVENT_TYPING_START: &str = "TYPING_START";

// Voice events
pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

// ---- Inbound bodies ----

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub guilds: Vec<GuildSnapshot>,
    #[serde(default)]
    pub private_channels: Vec<Value>,
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resumed {
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}

/// The parts of a guild snapshot (READY entry or GUILD_CREATE body) needed to
/// decide whether the guild still has members to fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildSnapshot {
    #[serde(with = "snowflake::string")]
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub members: Vec<IgnoredAny>,
}

impl GuildSnapshot {
    /// Members still missing after the snapshot, if the guild needs chunking.
    pub fn missing_members(&self) -> Option<u64> {
        if self.unavailable {
            return None;
        }
        let received = self.members.len() as u64;
        match self.member_count {
            Some(expected) if expected > received => Some(expected),
            _ if self.large => Some(self.member_count.unwrap_or(received)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildDelete {
    #[serde(with = "snowflake::string")]
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMembersChunk {
    #[serde(with = "snowflake::string")]
    pub guild_id: Snowflake,
    #[serde(default)]
    pub members: Vec<IgnoredAny>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub chunk_count: Option<u32>,
}

/// GUILD_MEMBER_ADD / GUILD_MEMBER_REMOVE, reduced to the guild they touch.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberDelta {
    #[serde(with = "snowflake::string")]
    pub guild_id: Snowflake,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildSyncBody {
    #[serde(with = "snowflake::string")]
    pub id: Snowflake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    #[serde(with = "snowflake::string")]
    pub guild_id: Snowflake,
    #[serde(default)]
    pub endpoint: Option<String>,
}

// ---- Outbound bodies ----

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "strand".to_string(),
            device: "strand".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub since: Option<u64>,
    #[serde(default)]
    pub game: Option<Value>,
    pub status: String,
    #[serde(default)]
    pub afk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    #[serde(with = "snowflake::string")]
    pub guild_id: Snowflake,
    #[serde(with = "snowflake::option")]
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateUpdate {
    pub fn join(guild_id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: false,
            self_deaf: false,
        }
    }

    /// Leave whatever voice channel is active in the guild.
    pub fn disconnect(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestGuildMembers {
    #[serde(with = "snowflake::list")]
    pub guild_id: Vec<Snowflake>,
    pub query: String,
    pub limit: u32,
}

impl RequestGuildMembers {
    /// Request every member of the given guilds.
    pub fn all(guild_id: Vec<Snowflake>) -> Self {
        Self {
            guild_id,
            query: String::new(),
            limit: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn opcode_round_trips_known_and_unknown() {
        for raw in [0u8, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11, 12] {
            assert_eq!(u8::from(OpCode::from(raw)), raw);
        }
        assert_eq!(OpCode::from(42), OpCode::Other(42));
        assert_eq!(u8::from(OpCode::Other(42)), 42);
    }

    #[test]
    fn decodes_dispatch_envelope() {
        let msg: GatewayMessage = serde_json::from_value(json!({
            "op": 0, "s": 12, "t": "MESSAGE_CREATE", "d": {"content": "hi"}
        }))
        .unwrap();
        assert_eq!(msg.op, OpCode::Dispatch);
        assert_eq!(msg.s, Some(12));
        assert_eq!(msg.event_type(), Some(EVENT_MESSAGE_CREATE));
    }

    #[test]
    fn heartbeat_serializes_null_before_first_sequence() {
        let text = serde_json::to_string(&GatewayMessage::heartbeat(None)).unwrap();
        assert_eq!(text, r#"{"op":1,"d":null}"#);
        let text = serde_json::to_string(&GatewayMessage::heartbeat(Some(7))).unwrap();
        assert_eq!(text, r#"{"op":1,"d":7}"#);
    }

    #[test]
    fn identify_shape() {
        let identify = Identify {
            token: "abc".into(),
            properties: IdentifyProperties::default(),
            compress: true,
            large_threshold: 250,
            shard: Some([1, 4]),
            presence: None,
        };
        let msg = GatewayMessage::command(OpCode::Identify, &identify).unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["shard"], json!([1, 4]));
        assert_eq!(value["d"]["properties"]["$browser"], "strand");
        assert!(value["d"].get("presence").is_none());
    }

    #[test]
    fn voice_disconnect_sends_null_channel() {
        let value = serde_json::to_value(VoiceStateUpdate::disconnect(10)).unwrap();
        assert_eq!(
            value,
            json!({"guild_id": "10", "channel_id": null, "self_mute": false, "self_deaf": false})
        );
    }

    #[test]
    fn snapshot_reports_missing_members() {
        let small: GuildSnapshot =
            serde_json::from_value(json!({"id": "1", "member_count": 2, "members": [{}, {}]}))
                .unwrap();
        assert_eq!(small.missing_members(), None);

        let large: GuildSnapshot = serde_json::from_value(
            json!({"id": "2", "large": true, "member_count": 900, "members": [{}]}),
        )
        .unwrap();
        assert_eq!(large.missing_members(), Some(900));

        let gone: GuildSnapshot =
            serde_json::from_value(json!({"id": "3", "unavailable": true})).unwrap();
        assert_eq!(gone.missing_members(), None);
    }

    #[test]
    fn member_request_body() {
        let body = serde_json::to_value(RequestGuildMembers::all(vec![1, 2])).unwrap();
        assert_eq!(body, json!({"guild_id": ["1", "2"], "query": "", "limit": 0}));
    }
}
