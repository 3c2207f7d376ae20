use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    docker::DEFAULT_DOCKER_BINARY,
    workers::{WorkerPoolConfig, DEFAULT_MAX_IDLE_TIME, DEFAULT_NETWORK},
};

pub const MEMORY_BROKER_URL: &str = "memory://";

// Environment variables read on top of the config file, matched
// case-insensitively against the field names.
const ENV_OVERRIDES: [&str; 5] = [
    "listen_addr",
    "event_broker_url",
    "docker_binary_path",
    "docker_network",
    "max_watcher_idle_time",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OTLP collector, e.g. http://localhost:4317. Uses the exporter's
    // default when unset.
    pub endpoint: Option<String>,
    /// Seconds between metric exports.
    pub metrics_interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub listen_addr: String,
    pub event_broker_url: String,
    pub docker_binary_path: String,
    pub docker_network: String,
    /// Milliseconds a ready worker may sit without runs before shutting down.
    pub max_watcher_idle_time: u64,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: "local".to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:8900".to_string(),
            event_broker_url: "redis://event-broker:6379".to_string(),
            docker_binary_path: DEFAULT_DOCKER_BINARY.to_string(),
            docker_network: DEFAULT_NETWORK.to_string(),
            max_watcher_idle_time: DEFAULT_MAX_IDLE_TIME.as_millis() as u64,
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then the YAML file if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("unable to read config file {}: {e}", path.display()))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: ServerConfig = figment.merge(Env::raw().only(&ENV_OVERRIDES)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.event_broker_url != MEMORY_BROKER_URL &&
            !self.event_broker_url.starts_with("redis://") &&
            !self.event_broker_url.starts_with("rediss://")
        {
            return Err(anyhow!(
                "unsupported event broker url: {}",
                self.event_broker_url
            ));
        }
        if self.max_watcher_idle_time == 0 {
            return Err(anyhow!("max_watcher_idle_time must be greater than 0"));
        }
        if self.docker_network.is_empty() {
            return Err(anyhow!("docker_network must not be empty"));
        }
        Ok(())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("hermes-{}", self.env))
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_idle_time: Duration::from_millis(self.max_watcher_idle_time),
            network: self.docker_network.clone(),
            ..WorkerPoolConfig::default()
        }
    }
}
