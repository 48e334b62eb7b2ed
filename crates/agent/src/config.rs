//! Agent configuration.

use anyhow::Result;
use serde::Deserialize;

/// Operator-facing agent settings, loaded from `WINGS_*` environment
/// variables. The control-plane identity (`WINGS_NODE_ID`, TLS material)
/// is loaded separately by the transport layer.
#[derive(Debug, Clone, Deserialize)]
pub struct WingsConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,

    /// HS256 secret for operator API bearer tokens.
    #[serde(default)]
    pub token_secret: String,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    60
}

impl Default for WingsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            token_secret: String::new(),
            metrics_interval_secs: default_metrics_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl WingsConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WINGS"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WingsConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(!config.debug);
        assert_eq!(config.metrics_interval_secs, 30);
        assert_eq!(config.heartbeat_interval_secs, 60);
    }

    #[test]
    fn deserializes_partial_input() {
        let config: WingsConfig =
            serde_json::from_str(r#"{"port": 9090, "debug": true}"#).unwrap();
        assert_eq!(config.port, 9090);
        assert!(config.debug);
        assert_eq!(config.host, "0.0.0.0");
    }
}
