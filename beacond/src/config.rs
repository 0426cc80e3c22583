use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_BROADCAST_PORT, DEFAULT_CONTROL_PORT};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub addresses: AddressConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// How often each advertised name is rebroadcast
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,
    /// Lifetime of a discovered record without a fresh advert
    #[serde(default = "default_advert_ttl")]
    pub advert_ttl_ms: u64,
    /// Bound on the broadcast-receive poll in each tick
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Control requests held at once; 1 serialises callers behind a pending discover
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
    #[serde(default = "default_bind_retry")]
    pub bind_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressConfig {
    #[serde(default = "default_dynamic_port_start")]
    pub dynamic_port_start: u16,
    #[serde(default = "default_dynamic_port_end")]
    pub dynamic_port_end: u16,
    /// IP patterns, most preferred first, e.g. `["192.168.*"]`
    #[serde(default)]
    pub prefer: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Grace on top of a request's own wait before the exchange is abandoned
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Length of each discover sub-request
    #[serde(default = "default_burst")]
    pub burst_ms: u64,
    #[serde(default = "default_discover_wait")]
    pub discover_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_broadcast_port() -> u16 {
    DEFAULT_BROADCAST_PORT
}

fn default_broadcast_interval() -> u64 {
    2_000
}

// Names share the broadcast round-robin, so any one name may only go out
// every few intervals.
fn default_advert_ttl() -> u64 {
    10 * default_broadcast_interval()
}

fn default_poll_timeout() -> u64 {
    50
}

fn default_max_pending() -> usize {
    32
}

fn default_bind_attempts() -> u32 {
    3
}

fn default_bind_retry() -> u64 {
    500
}

fn default_dynamic_port_start() -> u16 {
    0xC000
}

fn default_dynamic_port_end() -> u16 {
    0xFFFF
}

fn default_reply_timeout() -> u64 {
    5_000
}

fn default_burst() -> u64 {
    500
}

fn default_discover_wait() -> u64 {
    60_000
}

fn default_api_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:9997".to_string()
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            broadcast_port: default_broadcast_port(),
            broadcast_interval_ms: default_broadcast_interval(),
            advert_ttl_ms: default_advert_ttl(),
            poll_timeout_ms: default_poll_timeout(),
            max_pending: default_max_pending(),
            bind_attempts: default_bind_attempts(),
            bind_retry_ms: default_bind_retry(),
        }
    }
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            dynamic_port_start: default_dynamic_port_start(),
            dynamic_port_end: default_dynamic_port_end(),
            prefer: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout(),
            burst_ms: default_burst(),
            discover_wait_ms: default_discover_wait(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_listen(),
        }
    }
}

impl BeaconConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn advert_ttl(&self) -> Duration {
        Duration::from_millis(self.advert_ttl_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn bind_retry(&self) -> Duration {
        Duration::from_millis(self.bind_retry_ms)
    }
}

impl ClientConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn burst(&self) -> Duration {
        Duration::from_millis(self.burst_ms)
    }

    pub fn discover_wait(&self) -> Duration {
        Duration::from_millis(self.discover_wait_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks; `parse` and `beacon::start` both apply them.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.beacon.advert_ttl_ms > self.beacon.broadcast_interval_ms,
            "advert_ttl_ms ({}) must exceed broadcast_interval_ms ({})",
            self.beacon.advert_ttl_ms,
            self.beacon.broadcast_interval_ms
        );
        anyhow::ensure!(self.beacon.max_pending > 0, "max_pending must be at least 1");
        anyhow::ensure!(self.beacon.bind_attempts > 0, "bind_attempts must be at least 1");
        anyhow::ensure!(
            self.addresses.dynamic_port_start <= self.addresses.dynamic_port_end,
            "dynamic port range {}..={} is empty",
            self.addresses.dynamic_port_start,
            self.addresses.dynamic_port_end
        );
        anyhow::ensure!(self.client.burst_ms > 0, "burst_ms must be positive");
        anyhow::ensure!(self.client.reply_timeout_ms > 0, "reply_timeout_ms must be positive");
        Ok(())
    }
}
