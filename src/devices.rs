//! Instrument descriptors and the single "selected device" cell.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// An instrument as reported by discovery (LXI/VXI-11 `*IDN?` fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Network address the helper talks to, usually an IPv4 literal.
    pub address: String,
    /// Manufacturer / class string from the identification reply.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub is_connected: bool,
}

impl Device {
    /// A bare device that only knows its address.
    pub fn at(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            name: address.clone(),
            address,
            kind: None,
            model: None,
            is_connected: false,
        }
    }
}

/// Holds the currently selected instrument. No reachability checks.
#[derive(Default)]
pub struct DeviceRegistry {
    selected: RwLock<Option<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the selection unconditionally.
    pub async fn set_selected_device(&self, device: Device) {
        info!(address = %device.address, name = %device.name, "device selected");
        *self.selected.write().await = Some(device);
    }

    pub async fn clear(&self) {
        *self.selected.write().await = None;
    }

    pub async fn selected_device(&self) -> Option<Device> {
        self.selected.read().await.clone()
    }

    /// Address of the selected device, ignoring selections with an empty one.
    pub async fn selected_address(&self) -> Option<String> {
        self.selected
            .read()
            .await
            .as_ref()
            .map(|d| d.address.trim().to_string())
            .filter(|a| !a.is_empty())
    }
}
