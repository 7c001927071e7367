//! Node configuration.
//!
//! Loaded from a TOML file; every key has a default so an empty (or absent)
//! file yields a working node. The dotted keys from the daemon's
//! documentation map onto the tables below (`bind.zif`, `tor.socks`, ...).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub bind: BindConfig,
    pub database: DatabaseConfig,
    pub tor: TorConfig,
    pub socks: SocksConfig,
    pub net: NetConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Address the Zif protocol listens on.
    pub zif: String,
    /// Address the HTTP command facade binds to (consumed by the external
    /// daemon, carried here so one file configures the whole node).
    pub http: String,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            zif: "0.0.0.0:5050".into(),
            http: "127.0.0.1:8080".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/posts.db".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub enabled: bool,
    pub control: u16,
    pub socks: u16,
    #[serde(rename = "cookiePath")]
    pub cookie_path: String,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            control: 10051,
            socks: 10050,
            cookie_path: "./tor/".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 10050,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    #[serde(rename = "maxPeers")]
    pub max_peers: usize,
    /// Heartbeat period in seconds. The period doubles as the ping deadline.
    #[serde(rename = "heartbeatSecs")]
    pub heartbeat_secs: u64,
    /// Announce period in minutes.
    #[serde(rename = "announceMins")]
    pub announce_mins: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            heartbeat_secs: 30,
            announce_mins: 30,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist. Unknown keys are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)
            .map_err(|e| crate::error::ZifError::protocol(format!("bad config: {e}")))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_keys() {
        let config = Config::default();
        assert_eq!(config.bind.zif, "0.0.0.0:5050");
        assert_eq!(config.bind.http, "127.0.0.1:8080");
        assert_eq!(config.database.path, "./data/posts.db");
        assert!(config.tor.enabled);
        assert_eq!(config.tor.control, 10051);
        assert_eq!(config.tor.socks, 10050);
        assert_eq!(config.socks.port, 10050);
        assert_eq!(config.net.max_peers, 100);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [bind]
            zif = "127.0.0.1:6000"

            [net]
            maxPeers = 7
            "#,
        )
        .unwrap();
        assert_eq!(parsed.bind.zif, "127.0.0.1:6000");
        assert_eq!(parsed.bind.http, "127.0.0.1:8080");
        assert_eq!(parsed.net.max_peers, 7);
        assert_eq!(parsed.net.heartbeat_secs, 30);
    }
}
