use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceConfig {
    /// How long the relay waits for the voice transport and secret key.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Queued audio older than this is skipped by the mixer.
    #[serde(default = "default_jitter_staleness_ms")]
    pub jitter_staleness_ms: u64,
    /// Datagram read timeout of the receive loop.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_encryption_mode")]
    pub encryption_mode: String,
    /// Ceiling for the signaling reconnect backoff.
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            jitter_staleness_ms: default_jitter_staleness_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            encryption_mode: default_encryption_mode(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_jitter_staleness_ms() -> u64 {
    100
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_encryption_mode() -> String {
    "aead_aes256_gcm".into()
}
fn default_max_reconnect_delay_secs() -> u64 {
    60
}

impl VoiceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn jitter_staleness(&self) -> Duration {
        Duration::from_millis(self.jitter_staleness_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: VoiceConfig = serde_json::from_str(r#"{"jitter_staleness_ms": 60}"#).unwrap();
        assert_eq!(config.jitter_staleness(), Duration::from_millis(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.encryption_mode, "aead_aes256_gcm");
    }
}
