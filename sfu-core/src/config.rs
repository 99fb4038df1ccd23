use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration
///
/// Layered: optional `sfu.toml`, then `SFU__*` environment overrides
/// (e.g. `SFU__SERVER__PORT=9090`). The bare `PORT` variable is honoured on
/// top of both because existing deployments set only that.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// ICE servers handed to every peer connection.
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Self = ConfigBuilder::builder()
            .add_source(File::with_name("sfu").required(false))
            .add_source(Environment::with_prefix("SFU").separator("__"))
            .build()?
            .try_deserialize()?;
        config.apply_port_override(std::env::var("PORT").ok().as_deref());
        Ok(config)
    }

    /// A present, parsable `PORT` wins; anything else keeps the configured
    /// port (8080 by default).
    fn apply_port_override(&mut self, value: Option<&str>) {
        if let Some(port) = value.and_then(|raw| raw.parse().ok()) {
            self.server.port = port;
        }
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.webrtc.stun_servers.len(), 1);
    }

    #[test]
    fn port_override_applies_when_parsable() {
        let mut config = Config::default();
        config.apply_port_override(Some("9090"));
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn unparsable_port_falls_back_silently() {
        let mut config = Config::default();
        config.apply_port_override(Some("eight"));
        assert_eq!(config.server.port, 8080);
        config.apply_port_override(None);
        assert_eq!(config.server.port, 8080);
    }
}
