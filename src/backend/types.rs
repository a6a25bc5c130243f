//! Data returned by container backends
//!
//! These are plain serde structs; the RPC layer carries them as JSON values
//! and the CLI deserializes them back for rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alias naming an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAlias {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// An image containers can be created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub fingerprint: String,
    #[serde(default)]
    pub aliases: Vec<ImageAlias>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Size in bytes
    pub size: u64,
}

impl Image {
    /// Whether `id` is one of this image's aliases
    pub fn matches_alias(&self, id: &str) -> bool {
        self.aliases.iter().any(|a| a.name == id)
    }

    pub fn description(&self) -> Option<&str> {
        self.properties.get("description").map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// `inet` or `inet6`
    pub family: String,
    pub address: String,
    pub netmask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub hwaddr: String,
    #[serde(default)]
    pub counters: NetworkCounters,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

/// Runtime state of a user's container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
    #[serde(default)]
    pub disk: BTreeMap<String, DiskUsage>,
    #[serde(default)]
    pub memory: MemoryUsage,
    #[serde(default)]
    pub processes: u64,
    #[serde(default)]
    pub network: BTreeMap<String, NetworkInterface>,
}

/// Per-container configuration options
pub type ContainerConfig = BTreeMap<String, String>;
