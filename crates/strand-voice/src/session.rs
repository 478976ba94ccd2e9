use strand_models::gateway::VoiceServerUpdate;
use strand_models::voice::VoiceState;
use strand_models::Snowflake;

use crate::error::VoiceError;

/// Voice signaling protocol version appended to the endpoint.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Everything needed to open a voice connection, assembled from the two
/// gateway dispatches the server sends after a voice state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSessionInfo {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl VoiceSessionInfo {
    /// Combine VOICE_STATE_UPDATE and VOICE_SERVER_UPDATE bodies. A server
    /// update without an endpoint means the voice server is not allocated yet.
    pub fn from_events(state: &VoiceState, server: &VoiceServerUpdate) -> Result<Self, VoiceError> {
        let endpoint = server
            .endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(VoiceError::MissingField("endpoint"))?;
        if state.guild_id != Some(server.guild_id) {
            return Err(VoiceError::GuildMismatch);
        }
        if state.session_id.is_empty() {
            return Err(VoiceError::MissingField("session_id"));
        }
        Ok(Self {
            guild_id: server.guild_id,
            user_id: state.user_id,
            session_id: state.session_id.clone(),
            token: server.token.clone(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Signaling URL. The endpoint arrives as `host:80`; the port is dropped
    /// and the connection goes over TLS.
    pub fn gateway_url(&self) -> String {
        let host = self
            .endpoint
            .trim_start_matches("wss://")
            .trim_end_matches('/');
        let host = host.strip_suffix(":80").unwrap_or(host);
        format!("wss://{host}/?v={VOICE_GATEWAY_VERSION}")
    }
}
