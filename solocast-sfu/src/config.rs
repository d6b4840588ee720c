use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
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
    /// Directory served for non-API paths (the embedded web client).
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: "public".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
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
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// How long a broadcast gap may last before viewers are told about it
    pub disconnect_grace_secs: u64,
    /// Signaling-connection liveness probe interval
    pub keepalive_interval_secs: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            disconnect_grace_secs: 30,
            keepalive_interval_secs: 15,
        }
    }
}

impl WebRtcConfig {
    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Config {
    /// Load from a config file with environment overrides layered on top.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        ConfigBuilder::builder()
            .add_source(File::from(Path::new(path)))
            .add_source(Environment::with_prefix("SOLOCAST").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigBuilder::builder()
            .add_source(Environment::with_prefix("SOLOCAST").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load configuration: explicit path env var, then `./config.yaml`,
    /// then environment variables only. A plain `PORT` variable (the one
    /// most container platforms inject) overrides the listen port last.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SOLOCAST_CONFIG_PATH")
            .ok()
            .filter(|p| Path::new(p).exists())
            .or_else(|| {
                let cwd = "config.yaml";
                Path::new(cwd).exists().then(|| cwd.to_string())
            });

        let mut config = match config_path {
            Some(path) => {
                eprintln!("Loading config from {path}");
                Self::from_file(&path)?
            }
            None => Self::from_env().unwrap_or_default(),
        };

        config.apply_port_override(std::env::var("PORT").ok());
        Ok(config)
    }

    fn apply_port_override(&mut self, value: Option<String>) {
        if let Some(port) = value.and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration, collecting every problem instead of failing
    /// on the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.webrtc.disconnect_grace_secs == 0 {
            errors.push("webrtc.disconnect_grace_secs must be non-zero".to_string());
        }
        if self.webrtc.keepalive_interval_secs == 0 {
            errors.push("webrtc.keepalive_interval_secs must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
