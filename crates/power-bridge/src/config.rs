use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use modbus_client::ClientConfig;
use poller_actor::ActorConfig;
use types::{DeviceEndpoint, Polarity, DEFAULT_PORT, DEFAULT_UPDATE_INTERVAL_SECS, DEFAULT_UNIT_ID};

pub const CONFIG_ENV: &str = "POWER_BRIDGE_CONFIG";

const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub devices: Vec<DeviceEndpoint>,
    pub modbus: ClientConfig,
    pub poller: ActorConfig,
    pub channel_capacity: usize,
    pub respawn_delay_ms: u64,
    pub metrics_listen: Option<String>,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("at least one device must be configured");
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                anyhow::bail!("devices.id must be non-empty");
            }
            if !ids.insert(device.id.as_str()) {
                anyhow::bail!("devices.id '{}' is configured more than once", device.id);
            }
            if device.host.trim().is_empty() {
                anyhow::bail!("devices.host must be non-empty for '{}'", device.id);
            }
            if device.port == 0 {
                anyhow::bail!("devices.port must be between 1 and 65535 for '{}'", device.id);
            }
            if device.update_interval.is_zero() {
                anyhow::bail!("devices.update_interval must be >= 1 for '{}'", device.id);
            }
        }

        if self.modbus.timeout_ms == 0 {
            anyhow::bail!("modbus.timeout_ms must be >= 1");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("bridge.channel_capacity must be >= 1");
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("bridge.respawn_delay_ms must be >= 1");
        }
        self.metrics_addr()?;

        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_listen
            .as_deref()
            .map(|value| {
                value
                    .parse::<SocketAddr>()
                    .with_context(|| format!("bridge.metrics_listen '{value}' is not a socket address"))
            })
            .transpose()
    }

    /// Devices whose registers cannot be resolved. They are still polled so
    /// that every cycle reports the misconfiguration.
    pub fn unpollable_devices(&self) -> Vec<&DeviceEndpoint> {
        self.devices
            .iter()
            .filter(|device| device.register_layout().is_err())
            .collect()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            modbus: ClientConfig::default(),
            poller: ActorConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Some(timeout_ms) = parse_env_u64("POWER_BRIDGE_MODBUS_TIMEOUT_MS") {
        config.modbus.timeout_ms = timeout_ms;
    }

    if let Some(stagger_ms) = parse_env_u64("POWER_BRIDGE_STAGGER_MS") {
        config.poller.stagger_ms = stagger_ms;
    }

    if let Some(publish) = parse_env_bool("POWER_BRIDGE_PUBLISH_ON_FAILURE") {
        config.poller.publish_on_failure = publish;
    }

    if let Ok(value) = env::var("POWER_BRIDGE_DEVICES") {
        config.devices = parse_static_devices(&value);
    }

    config.channel_capacity =
        parse_env_usize("POWER_BRIDGE_CHANNEL_CAPACITY").unwrap_or(config.channel_capacity);
    config.respawn_delay_ms =
        parse_env_u64("POWER_BRIDGE_RESPAWN_DELAY_MS").unwrap_or(config.respawn_delay_ms);
    config.metrics_listen = env::var("POWER_BRIDGE_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    modbus: Option<FileModbusConfig>,
    poller: Option<FilePollerConfig>,
    bridge: Option<FileBridgeConfig>,
    devices: Option<Vec<FileDeviceConfig>>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    stagger_ms: Option<u64>,
    publish_on_failure: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileBridgeConfig {
    channel_capacity: Option<usize>,
    respawn_delay_ms: Option<u64>,
    metrics_listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    id: Option<String>,
    name: Option<String>,
    #[serde(alias = "ip")]
    host: String,
    port: Option<u16>,
    /// Seconds between polls.
    #[serde(alias = "updateInterval")]
    update_interval: Option<u64>,
    meter: Option<u8>,
    power_register: Option<u16>,
    scale_factor_register: Option<u16>,
    unsigned: Option<bool>,
    force_positive: Option<bool>,
}

impl FileDeviceConfig {
    fn into_endpoint(self) -> DeviceEndpoint {
        let id = self
            .id
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.host.clone());
        let mut endpoint = DeviceEndpoint::new(id, self.host);
        if let Some(name) = self.name {
            endpoint.name = name;
        }
        endpoint.port = self.port.unwrap_or(DEFAULT_PORT);
        endpoint.update_interval =
            Duration::from_secs(self.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS));
        endpoint.unit_id = DEFAULT_UNIT_ID;
        endpoint.meter = self.meter.unwrap_or(0);
        endpoint.power_register = self.power_register;
        endpoint.scale_factor_register = self.scale_factor_register;
        endpoint.unsigned = self.unsigned.unwrap_or(true);
        endpoint.polarity = Polarity::from_force_positive(self.force_positive.unwrap_or(true));
        endpoint
    }
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var(CONFIG_ENV) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(modbus) = file.modbus {
        if let Some(timeout_ms) = modbus.timeout_ms {
            config.modbus.timeout_ms = timeout_ms;
        }
    }

    if let Some(poller) = file.poller {
        if let Some(stagger_ms) = poller.stagger_ms {
            config.poller.stagger_ms = stagger_ms;
        }
        if let Some(publish) = poller.publish_on_failure {
            config.poller.publish_on_failure = publish;
        }
    }

    if let Some(bridge) = file.bridge {
        if let Some(capacity) = bridge.channel_capacity {
            config.channel_capacity = capacity;
        }
        if let Some(delay) = bridge.respawn_delay_ms {
            config.respawn_delay_ms = delay;
        }
        if let Some(listen) = bridge.metrics_listen {
            config.metrics_listen = Some(listen);
        }
    }

    if let Some(devices) = file.devices {
        config.devices = devices
            .into_iter()
            .map(FileDeviceConfig::into_endpoint)
            .collect();
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Parses `host[:port]` entries into inverter endpoints. Entries with an
/// unparsable port are logged and skipped.
fn parse_static_devices(value: &str) -> Vec<DeviceEndpoint> {
    value
        .split(',')
        .filter_map(|entry| {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                return None;
            }
            let (host, port) = match trimmed.split_once(':') {
                Some((host, port)) => match port.parse::<u16>() {
                    Ok(port) => (host, port),
                    Err(err) => {
                        warn!(
                            entry = trimmed,
                            error = %err,
                            "invalid port in POWER_BRIDGE_DEVICES, skipping device"
                        );
                        return None;
                    }
                },
                None => (trimmed, DEFAULT_PORT),
            };
            let mut endpoint = DeviceEndpoint::new(trimmed, host);
            endpoint.port = port;
            Some(endpoint)
        })
        .collect()
}
