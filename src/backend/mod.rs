//! Container management backend
//!
//! The daemon does not run containers itself. Every lifecycle operation is
//! delegated to a [`Backend`], always on behalf of an owner account that the
//! RPC layer has already authorized.

pub mod memory;
pub mod types;

use crate::error::Result;
use std::os::unix::net::UnixStream;

pub use memory::MemoryBackend;
pub use types::{
    ContainerConfig, ContainerStatus, DiskUsage, Image, ImageAlias, MemoryUsage, NetworkAddress,
    NetworkCounters, NetworkInterface,
};

/// Operations the daemon calls into
///
/// Implementations guard their own shared state; calls arrive concurrently
/// from independent connection workers.
pub trait Backend: Send + Sync {
    fn list_images(&self) -> Result<Vec<Image>>;

    fn create_container(&self, fingerprint: &str, owner: &str) -> Result<()>;

    fn container_status(&self, owner: &str) -> Result<ContainerStatus>;

    fn container_log(&self, owner: &str) -> Result<String>;

    /// Open the container's console with an initial size
    ///
    /// Returns the container side of the console as a byte stream. Closing
    /// it detaches; it must not stop the container.
    fn open_console(&self, owner: &str, width: u16, height: u16) -> Result<UnixStream>;

    /// Forward new dimensions to the console's pseudo-terminal
    fn resize_console(&self, owner: &str, width: u16, height: u16) -> Result<()>;

    fn shutdown_container(&self, owner: &str) -> Result<()>;

    fn reboot_container(&self, owner: &str) -> Result<()>;

    fn delete_container(&self, owner: &str) -> Result<()>;

    fn get_config(&self, owner: &str) -> Result<ContainerConfig>;

    fn set_config_option(&self, owner: &str, key: &str, value: &str) -> Result<()>;

    fn unset_config_option(&self, owner: &str, key: &str) -> Result<()>;
}
