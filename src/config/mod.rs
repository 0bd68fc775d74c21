use crate::env::{EnvIdentifiers, EnvironmentParams};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Complete relay configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub environments: HashMap<String, EnvConfig>,
}

/// Process-level options
#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_uri: String,
    #[serde(default)]
    pub stream_uri: String,
    #[serde(default)]
    pub events_uri: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    #[serde(default)]
    pub tls_min_version: String,
    /// Enables the auto-configuration subscriber when non-empty
    #[serde(default)]
    pub auto_config_key: String,
    #[serde(default)]
    pub exit_always: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
}

fn default_port() -> u16 {
    8030
}

fn default_heartbeat_interval() -> u64 {
    10
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_uri: String::new(),
            stream_uri: String::new(),
            events_uri: String::new(),
            tls_enabled: false,
            tls_cert: String::new(),
            tls_key: String::new(),
            tls_min_version: String::new(),
            auto_config_key: String::new(),
            exit_always: false,
            heartbeat_interval_seconds: default_heartbeat_interval(),
        }
    }
}

impl MainConfig {
    /// SSE keepalive comments go out every three heartbeat intervals so idle
    /// intermediaries do not drop streaming connections.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds * 3)
    }
}

/// Event proxy options
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_seconds: u64,
}

fn default_flush_timeout() -> u64 {
    5
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_timeout_seconds: default_flush_timeout(),
        }
    }
}

/// One statically configured environment
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnvConfig {
    #[serde(default)]
    pub sdk_key: Option<String>,
    #[serde(default)]
    pub mobile_key: Option<String>,
    #[serde(default)]
    pub env_id: Option<String>,
    #[serde(default)]
    pub secure_mode: bool,
    /// Zero disables caching headers on polling responses
    #[serde(default)]
    pub ttl_minutes: u64,
}

impl EnvConfig {
    pub fn environment_params(&self, name: &str) -> EnvironmentParams {
        EnvironmentParams {
            identifiers: EnvIdentifiers {
                name: name.to_string(),
                ..Default::default()
            },
            sdk_key: self.sdk_key.clone(),
            mobile_key: self.mobile_key.clone(),
            env_id: self.env_id.clone(),
            expiring_sdk_key: None,
            secure_mode: self.secure_mode,
            ttl: Duration::from_secs(self.ttl_minutes * 60),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<RelayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path))?;
    let config: RelayConfig =
        toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
