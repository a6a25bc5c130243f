//! Daemon configuration
//!
//! Settings come from built-in defaults, then `/etc/webspaced.conf` (or the
//! file given with `-c`), then `WEBSPACED_*` environment variables, then
//! command-line flags. The file uses the same names as the environment:
//! - WEBSPACED_BIND_SOCKET=path
//! - WEBSPACED_CONSOLE_DIR=path
//! - WEBSPACED_ADMIN_GROUP=group
//! - WEBSPACED_CONTAINER_SUFFIX=suffix
//! - WEBSPACED_DRAIN_TIMEOUT=seconds
//! - WEBSPACED_ATTACH_TIMEOUT=seconds
//!
//! YAML files from older deployments are not understood; every line in them
//! is skipped and the defaults stand.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default daemon socket, shared with the CLI
pub const DEFAULT_SOCKET: &str = "/var/lib/webspace-ng/unix.socket";

/// Default configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/webspaced.conf";

const ENV_PREFIX: &str = "WEBSPACED_";

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Unix socket the RPC server listens on
    pub bind_socket: PathBuf,
    /// Directory holding per-session console sockets
    pub console_dir: PathBuf,
    /// Members of this group may act as other users
    pub admin_group: String,
    /// Appended to the owner's name to form the container name
    pub container_suffix: String,
    /// How long shutdown waits for in-flight calls
    pub drain_timeout: Duration,
    /// How long a console session waits for the proxy to connect
    pub attach_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_socket: PathBuf::from(DEFAULT_SOCKET),
            console_dir: PathBuf::from("/var/lib/webspace-ng/consoles"),
            admin_group: "webspace-admin".to_string(),
            container_suffix: "-ws".to_string(),
            drain_timeout: Duration::from_secs(5),
            attach_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Load defaults, the config file and the process environment
    ///
    /// An explicitly requested file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?,
            None => Self::from_file(Path::new(DEFAULT_CONFIG_FILE)).unwrap_or_default(),
        };
        config.apply_env(std::env::vars());
        Ok(config)
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse configuration from content string, starting from defaults
    pub fn parse(content: &str) -> Self {
        let mut config = DaemonConfig::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.apply(&key, &unquote(&value));
            }
        }

        config
    }

    /// Override settings from `WEBSPACED_*` variables
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key.starts_with(ENV_PREFIX) {
                self.apply(&key, &value);
            }
        }
    }

    /// Apply one setting; unknown keys and unparsable durations are ignored
    pub fn apply(&mut self, key: &str, value: &str) {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            return;
        };

        match name {
            "BIND_SOCKET" => self.bind_socket = PathBuf::from(value),
            "CONSOLE_DIR" => self.console_dir = PathBuf::from(value),
            "ADMIN_GROUP" => self.admin_group = value.to_string(),
            "CONTAINER_SUFFIX" => self.container_suffix = value.to_string(),
            "DRAIN_TIMEOUT" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.drain_timeout = Duration::from_secs(secs);
                }
            }
            "ATTACH_TIMEOUT" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.attach_timeout = Duration::from_secs(secs);
                }
            }
            _ => log::debug!("Ignoring unknown setting {}", key),
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}
