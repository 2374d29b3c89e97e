use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A device on the local network as reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub ip: IpAddr,
    pub board: String,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl Device {
    pub fn new(id: &str, ip: IpAddr, board: &str) -> Self {
        Device {
            id: id.to_string(),
            ip,
            board: board.to_string(),
            online: true,
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.id)
    }
}

/// Stable identity of a device, independent of the rest of its record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(id: &str) -> Self {
        DeviceKey(id.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

///
/// Resolves device selectors to live device records.
///
/// Discovery is not part of this crate. The gateway only consumes the
/// directory it maintains through this trait.
///
pub trait DeviceDirectory: Send + Sync {
    /// Returns the live device matching `selector`, if any.
    fn resolve(&self, selector: &str) -> Option<Device>;

    /// Every device currently known.
    fn devices(&self) -> Vec<Device>;
}

/// A directory over a fixed device list, usually taken from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticDeviceDirectory {
    devices: Vec<Device>,
}

impl StaticDeviceDirectory {
    pub fn new(devices: Vec<Device>) -> Self {
        StaticDeviceDirectory { devices }
    }
}

impl DeviceDirectory for StaticDeviceDirectory {
    fn resolve(&self, selector: &str) -> Option<Device> {
        let wanted = DeviceKey::new(selector);
        self.devices
            .iter()
            .filter(|device| device.online)
            .find(|device| device.key() == wanted || device.ip.to_string() == selector.trim())
            .cloned()
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }
}
