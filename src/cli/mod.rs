//! `webspace` command line front end

pub mod commands;
pub mod render;

use crate::daemon::config::DEFAULT_SOCKET;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "webspace")]
#[command(version)]
#[command(about = "Manage your personal container")]
pub struct Cli {
    /// Path to the daemon's Unix socket
    #[arg(short = 'c', long = "socket", env = "WEBSPACE_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket_path: PathBuf,

    /// User to perform operations as (administrators only)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Show debug output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List available images
    Images,
    /// Create your container
    Init {
        /// Image alias / fingerprint to create your container from
        image: String,
    },
    /// Show the status of your container
    Status,
    /// Retrieve your container's system log
    Log,
    /// Attach to your container's console
    Console,
    /// Shutdown your container
    Shutdown,
    /// Reboot your container
    Reboot,
    /// Delete your container
    Delete {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Change your container's options
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show container configuration
    Show,
    /// Set a config option
    Set {
        /// Key of option to set
        key: String,
        /// Value of option to set
        value: String,
    },
    /// Delete a config option
    Unset {
        /// Key of option to delete
        key: String,
    },
}

pub use commands::run;

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_options() {
        let cli = Cli::try_parse_from(["webspace", "-c", "/tmp/ws.sock", "-u", "alice", "status"]).unwrap();
        assert_eq!(cli.socket_path, PathBuf::from("/tmp/ws.sock"));
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_config_defaults_to_show() {
        let cli = Cli::try_parse_from(["webspace", "config"]).unwrap();
        assert!(matches!(cli.command, Command::Config { action: None }));

        let cli = Cli::try_parse_from(["webspace", "config", "set", "boot.autostart", "true"]).unwrap();
        match cli.command {
            Command::Config {
                action: Some(ConfigAction::Set { key, value }),
            } => {
                assert_eq!(key, "boot.autostart");
                assert_eq!(value, "true");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_init_requires_image() {
        assert!(Cli::try_parse_from(["webspace", "init"]).is_err());
    }
}
