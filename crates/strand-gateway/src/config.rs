use std::fs;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Shard position used in IDENTIFY as `[id, total]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShardInfo {
    pub id: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    /// Ask for `zlib-stream` transport compression.
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Ceiling for the exponential reconnect backoff.
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    /// Fixed delay used after an identify that was never confirmed.
    #[serde(default = "default_identify_retry_delay_secs")]
    pub identify_retry_delay_secs: u64,
    /// Minimum spacing between identify attempts sharing one connect queue.
    #[serde(default = "default_connect_spacing_secs")]
    pub connect_spacing_secs: u64,
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    pub shard: Option<ShardInfo>,
    /// Request GUILD_SYNC for guilds during bootstrap (user accounts only).
    #[serde(default = "default_false")]
    pub guild_sync: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Close and reconnect when a heartbeat is due while the previous one
    /// is still unacknowledged.
    #[serde(default = "default_false")]
    pub strict_heartbeat_acks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            gateway_url: default_gateway_url(),
            api_version: default_api_version(),
            compress: true,
            auto_reconnect: true,
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            identify_retry_delay_secs: default_identify_retry_delay_secs(),
            connect_spacing_secs: default_connect_spacing_secs(),
            large_threshold: default_large_threshold(),
            shard: None,
            guild_sync: false,
            event_capacity: default_event_capacity(),
            strict_heartbeat_acks: false,
        }
    }
}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg".into()
}
fn default_api_version() -> u8 {
    6
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_max_reconnect_delay_secs() -> u64 {
    900
}
fn default_identify_retry_delay_secs() -> u64 {
    5
}
fn default_connect_spacing_secs() -> u64 {
    5
}
fn default_large_threshold() -> u32 {
    250
}
fn default_event_capacity() -> usize {
    4096
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("STRAND_TOKEN") {
            self.token = value;
        }
        if let Ok(value) = std::env::var("STRAND_AUTO_RECONNECT") {
            if let Ok(parsed) = value.trim().parse::<bool>() {
                self.auto_reconnect = parsed;
            }
        }
        if let Ok(value) = std::env::var("STRAND_MAX_RECONNECT_DELAY_SECS") {
            if let Some(parsed) = value.trim().parse::<u64>().ok().filter(|v| *v > 0) {
                self.max_reconnect_delay_secs = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(shard) = self.shard {
            if shard.total == 0 || shard.id >= shard.total {
                anyhow::bail!("shard {} is out of range for {} shards", shard.id, shard.total);
            }
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be positive");
        }
        Ok(())
    }

    /// Gateway URL with version, encoding and compression parameters.
    pub fn connect_url(&self) -> String {
        let base = self.gateway_url.trim_end_matches('/');
        let mut url = format!("{base}/?v={}&encoding=json", self.api_version);
        if self.compress {
            url.push_str("&compress=zlib-stream");
        }
        url
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    pub fn identify_retry_delay(&self) -> Duration {
        Duration::from_secs(self.identify_retry_delay_secs)
    }

    pub fn connect_spacing(&self) -> Duration {
        Duration::from_secs(self.connect_spacing_secs)
    }

    pub(crate) fn shard_label(&self) -> u32 {
        self.shard.map(|s| s.id).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = GatewayConfig::from_toml_str("token = \"abc\"").unwrap();
        assert_eq!(config.token, "abc");
        assert!(config.auto_reconnect);
        assert_eq!(config.large_threshold, 250);
        assert_eq!(config.max_reconnect_delay(), Duration::from_secs(900));
        assert_eq!(config.shard, None);
    }

    #[test]
    fn connect_url_carries_parameters() {
        let mut config = GatewayConfig::new("t");
        config.gateway_url = "wss://gateway.example/".into();
        assert_eq!(
            config.connect_url(),
            "wss://gateway.example/?v=6&encoding=json&compress=zlib-stream"
        );
        config.compress = false;
        assert_eq!(config.connect_url(), "wss://gateway.example/?v=6&encoding=json");
    }

    #[test]
    fn rejects_shard_out_of_range() {
        let err = GatewayConfig::from_toml_str(
            "token = \"t\"\n[shard]\nid = 4\ntotal = 4\n",
        );
        assert!(err.is_err());

        let ok = GatewayConfig::from_toml_str("[shard]\nid = 1\ntotal = 4\n").unwrap();
        assert_eq!(ok.shard, Some(ShardInfo { id: 1, total: 4 }));
    }
}
