//! In-process reference backend
//!
//! Keeps one simulated container per owner. The console is a socket pair
//! whose far end echoes whatever it receives, which is enough to exercise
//! the console attach path end to end.

use super::types::{
    ContainerConfig, ContainerStatus, DiskUsage, Image, ImageAlias, MemoryUsage, NetworkAddress,
    NetworkCounters, NetworkInterface,
};
use super::Backend;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, MutexGuard};
use std::thread;

/// Default container name suffix
pub const DEFAULT_SUFFIX: &str = "-ws";

#[derive(Debug)]
struct Container {
    name: String,
    image: String,
    running: bool,
    boots: u32,
    log: Vec<String>,
    config: ContainerConfig,
    console_size: Option<(u16, u16)>,
}

impl Container {
    fn boot(&mut self) {
        self.boots += 1;
        self.running = true;
        self.log.push(format!("[boot {}] Starting {} from image {}", self.boots, self.name, self.image));
        self.log.push(format!("[boot {}] Reached target Multi-User System.", self.boots));
    }

    fn halt(&mut self) {
        self.running = false;
        self.log.push(format!("[boot {}] Reached target Power-Off.", self.boots));
    }
}

/// Backend that simulates containers in memory
pub struct MemoryBackend {
    suffix: String,
    images: Vec<Image>,
    containers: Mutex<HashMap<String, Container>>,
}

impl MemoryBackend {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self::with_images(suffix, default_images())
    }

    pub fn with_images(suffix: impl Into<String>, images: Vec<Image>) -> Self {
        Self {
            suffix: suffix.into(),
            images,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Last console dimensions recorded for `owner`'s container
    pub fn console_size(&self, owner: &str) -> Option<(u16, u16)> {
        self.lock().get(owner).and_then(|c| c.console_size)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Container>> {
        // A panicking handler must not wedge every other caller
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_container<T>(&self, owner: &str, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        let mut containers = self.lock();
        let container = containers
            .get_mut(owner)
            .ok_or_else(|| Error::backend("You don't have a container"))?;
        f(container)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX)
    }
}

impl Backend for MemoryBackend {
    fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.images.clone())
    }

    fn create_container(&self, fingerprint: &str, owner: &str) -> Result<()> {
        let image = self
            .images
            .iter()
            .find(|i| i.fingerprint == fingerprint)
            .ok_or_else(|| Error::backend(format!("Image {} does not exist", fingerprint)))?;

        let mut containers = self.lock();
        if containers.contains_key(owner) {
            return Err(Error::backend("You already have a container"));
        }

        let mut container = Container {
            name: format!("{}{}", owner, self.suffix),
            image: image.fingerprint.clone(),
            running: false,
            boots: 0,
            log: Vec::new(),
            config: ContainerConfig::new(),
            console_size: None,
        };
        container.boot();
        log::info!("Created container {} for {}", container.name, owner);
        containers.insert(owner.to_string(), container);
        Ok(())
    }

    fn container_status(&self, owner: &str) -> Result<ContainerStatus> {
        self.with_container(owner, |c| {
            let mut network = BTreeMap::new();
            network.insert(
                "lo".to_string(),
                NetworkInterface {
                    hwaddr: "00:00:00:00:00:00".to_string(),
                    counters: NetworkCounters::default(),
                    addresses: vec![NetworkAddress {
                        family: "inet".to_string(),
                        address: "127.0.0.1".to_string(),
                        netmask: "8".to_string(),
                    }],
                },
            );
            if c.running {
                network.insert(
                    "eth0".to_string(),
                    NetworkInterface {
                        hwaddr: "00:16:3e:00:00:01".to_string(),
                        counters: NetworkCounters {
                            bytes_sent: 4096 * u64::from(c.boots),
                            bytes_received: 65536 * u64::from(c.boots),
                        },
                        addresses: vec![
                            NetworkAddress {
                                family: "inet".to_string(),
                                address: "10.0.3.2".to_string(),
                                netmask: "24".to_string(),
                            },
                            NetworkAddress {
                                family: "inet6".to_string(),
                                address: "fd42::2".to_string(),
                                netmask: "64".to_string(),
                            },
                        ],
                    },
                );
            }

            let mut disk = BTreeMap::new();
            disk.insert("root".to_string(), DiskUsage { usage: 512 * 1024 * 1024 });

            Ok(ContainerStatus {
                status: if c.running { "Running" } else { "Stopped" }.to_string(),
                disk,
                memory: MemoryUsage {
                    usage: if c.running { 64 * 1024 * 1024 } else { 0 },
                },
                processes: if c.running { 12 } else { 0 },
                network,
            })
        })
    }

    fn container_log(&self, owner: &str) -> Result<String> {
        self.with_container(owner, |c| Ok(c.log.join("\n")))
    }

    fn open_console(&self, owner: &str, width: u16, height: u16) -> Result<UnixStream> {
        let name = self.with_container(owner, |c| {
            if !c.running {
                return Err(Error::backend("Your container is not running"));
            }
            c.console_size = Some((width, height));
            Ok(c.name.clone())
        })?;

        let (daemon_side, console_side) = UnixStream::pair()?;
        thread::Builder::new()
            .name(format!("console-{}", name))
            .spawn(move || echo_console(console_side))?;

        Ok(daemon_side)
    }

    fn resize_console(&self, owner: &str, width: u16, height: u16) -> Result<()> {
        self.with_container(owner, |c| {
            c.console_size = Some((width, height));
            Ok(())
        })
    }

    fn shutdown_container(&self, owner: &str) -> Result<()> {
        self.with_container(owner, |c| {
            if !c.running {
                return Err(Error::backend("Your container is not running"));
            }
            c.halt();
            Ok(())
        })
    }

    fn reboot_container(&self, owner: &str) -> Result<()> {
        self.with_container(owner, |c| {
            if c.running {
                c.halt();
            }
            c.boot();
            Ok(())
        })
    }

    fn delete_container(&self, owner: &str) -> Result<()> {
        let removed = self
            .lock()
            .remove(owner)
            .ok_or_else(|| Error::backend("You don't have a container"))?;
        log::info!("Deleted container {}", removed.name);
        Ok(())
    }

    fn get_config(&self, owner: &str) -> Result<ContainerConfig> {
        self.with_container(owner, |c| Ok(c.config.clone()))
    }

    fn set_config_option(&self, owner: &str, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::backend("Option key must not be empty"));
        }
        self.with_container(owner, |c| {
            c.config.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn unset_config_option(&self, owner: &str, key: &str) -> Result<()> {
        self.with_container(owner, |c| {
            c.config
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| Error::backend(format!("Option '{}' is not set", key)))
        })
    }
}

fn echo_console(mut stream: UnixStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}

fn default_images() -> Vec<Image> {
    let image = |fingerprint: &str, alias: &str, description: &str, size: u64| {
        let mut properties = BTreeMap::new();
        properties.insert("description".to_string(), description.to_string());
        Image {
            fingerprint: fingerprint.to_string(),
            aliases: vec![ImageAlias {
                name: alias.to_string(),
                description: String::new(),
            }],
            properties,
            size,
        }
    };

    vec![
        image(
            "6d1c1d1e1a3a0e9a2d8c6f0b1f0e4b2a7c9d3e5f8a1b2c3d4e5f60718293a4b5",
            "ubuntu/22.04",
            "Ubuntu 22.04 LTS amd64",
            213 * 1024 * 1024,
        ),
        image(
            "b0a1c2d3e4f5061728394a5b6c7d8e9f0a1b2c3d4e5f60718293a4b5c6d7e8f9",
            "debian/12",
            "Debian bookworm amd64",
            98 * 1024 * 1024,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_container(owner: &str) -> MemoryBackend {
        let backend = MemoryBackend::default();
        let fingerprint = backend.list_images().unwrap()[0].fingerprint.clone();
        backend.create_container(&fingerprint, owner).unwrap();
        backend
    }

    #[test]
    fn test_create_requires_known_image() {
        let backend = MemoryBackend::default();
        let err = backend.create_container("deadbeef", "alice").unwrap_err();
        assert!(err.to_string().contains("deadbeef"));
    }

    #[test]
    fn test_one_container_per_owner() {
        let backend = backend_with_container("alice");
        let fingerprint = backend.list_images().unwrap()[1].fingerprint.clone();
        assert!(backend.create_container(&fingerprint, "alice").is_err());
        assert!(backend.create_container(&fingerprint, "bob").is_ok());
    }

    #[test]
    fn test_lifecycle() {
        let backend = backend_with_container("alice");
        assert_eq!(backend.container_status("alice").unwrap().status, "Running");

        backend.shutdown_container("alice").unwrap();
        let status = backend.container_status("alice").unwrap();
        assert_eq!(status.status, "Stopped");
        assert_eq!(status.processes, 0);
        assert!(backend.shutdown_container("alice").is_err());

        backend.reboot_container("alice").unwrap();
        assert_eq!(backend.container_status("alice").unwrap().status, "Running");
        assert!(backend.container_log("alice").unwrap().contains("[boot 2]"));

        backend.delete_container("alice").unwrap();
        assert!(backend.container_status("alice").is_err());
    }

    #[test]
    fn test_config_options() {
        let backend = backend_with_container("alice");
        backend.set_config_option("alice", "boot.autostart", "true").unwrap();
        assert_eq!(
            backend.get_config("alice").unwrap().get("boot.autostart"),
            Some(&"true".to_string())
        );

        backend.unset_config_option("alice", "boot.autostart").unwrap();
        assert!(backend.get_config("alice").unwrap().is_empty());
        assert!(backend.unset_config_option("alice", "boot.autostart").is_err());
        assert!(backend.set_config_option("alice", "", "x").is_err());
    }

    #[test]
    fn test_console_echoes_and_records_size() {
        let backend = backend_with_container("alice");
        let mut console = backend.open_console("alice", 120, 40).unwrap();
        assert_eq!(backend.console_size("alice"), Some((120, 40)));

        console.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        console.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        backend.resize_console("alice", 100, 30).unwrap();
        assert_eq!(backend.console_size("alice"), Some((100, 30)));
    }

    #[test]
    fn test_console_requires_running_container() {
        let backend = backend_with_container("alice");
        backend.shutdown_container("alice").unwrap();
        assert!(backend.open_console("alice", 80, 24).is_err());
        assert!(backend.open_console("nobody", 80, 24).is_err());
    }
}
