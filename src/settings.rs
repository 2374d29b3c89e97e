use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::device::Device;
use crate::ota::orchestrator::{DEFAULT_SWEEP_INTERVAL, DEFAULT_WORKERS};
use crate::ota::task::TransferSettings;

/// Prefix of environment overrides, e.g. `OTA_SERVER__PORT=9090`.
pub const ENV_PREFIX: &str = "OTA";
pub const ENV_SEPARATOR: &str = "__";

///
/// Gateway configuration.
///
/// Read from the `config` file (any format the `config` crate knows) and
/// overridden from the environment. Every key has a default so the gateway
/// also starts without a file.
///
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub ota: OtaSettings,
    pub devices: Vec<Device>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: [u8; 4],
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: [0, 0, 0, 0],
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub firmware_dir: PathBuf,
    pub metadata_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            firmware_dir: PathBuf::from("./data/firmware"),
            metadata_dir: PathBuf::from("./data/metadata"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OtaSettings {
    pub workers: usize,
    pub invitation_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub confirmation_window_ms: u64,
    pub sweep_interval_ms: u64,
    pub bind_address: IpAddr,
    /// board → invitation port, on top of the built-in table
    pub boards: HashMap<String, u16>,
}

impl Default for OtaSettings {
    fn default() -> Self {
        let transfer = TransferSettings::default();
        OtaSettings {
            workers: DEFAULT_WORKERS,
            invitation_timeout_ms: transfer.invitation_timeout.as_millis() as u64,
            accept_timeout_ms: transfer.accept_timeout.as_millis() as u64,
            ack_timeout_ms: transfer.ack_timeout.as_millis() as u64,
            confirmation_window_ms: transfer.confirmation_window.as_millis() as u64,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            boards: HashMap::new(),
        }
    }
}

impl OtaSettings {
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            bind_address: self.bind_address,
            invitation_timeout: Duration::from_millis(self.invitation_timeout_ms),
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            confirmation_window: Duration::from_millis(self.confirmation_window_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl GatewaySettings {
    /// Loads `config_name` (optional) and applies `OTA_*` overrides.
    pub fn load(config_name: &str) -> crate::Result<GatewaySettings> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(config_name).required(false))?
            .merge(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))?;
        Ok(settings.try_into::<GatewaySettings>()?)
    }
}
