//! Webspace daemon binary
//!
//! Binds the RPC socket, serves container operations until SIGINT or
//! SIGTERM, then drains in-flight calls and removes its sockets.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use webspace::backend::{Backend, MemoryBackend};
use webspace::console::ConsoleRegistry;
use webspace::daemon::{register_backend, DaemonConfig, MethodTable, RpcServer};
use webspace::signal::SignalHandler;

#[derive(Debug, Parser)]
#[command(name = "webspaced")]
#[command(version)]
#[command(about = "Container self-service daemon")]
struct Args {
    /// Config file (defaults to /etc/webspaced.conf when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket to listen on, overriding the config
    #[arg(short, long)]
    bind: Option<PathBuf>,

    /// Directory for console session sockets, overriding the config
    #[arg(long)]
    console_dir: Option<PathBuf>,

    /// Group whose members may act as other users, overriding the config
    #[arg(long)]
    admin_group: Option<String>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_socket = bind;
    }
    if let Some(dir) = args.console_dir {
        config.console_dir = dir;
    }
    if let Some(group) = args.admin_group {
        config.admin_group = group;
    }
    log::debug!("Loaded config: {:?}", config);

    if let Some(parent) = config.bind_socket.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new(config.container_suffix.clone()));
    let consoles = Arc::new(ConsoleRegistry::new(&config.console_dir, config.attach_timeout));

    let mut table = MethodTable::new();
    register_backend(&mut table, backend, Arc::clone(&consoles));
    log::debug!("Registered methods: {}", table.names().join(", "));

    let server = RpcServer::from_config(&config, table, consoles)?;
    let _signals = SignalHandler::install(server.shutdown_handle().cancellation())?;

    log::info!("webspaced {} started", env!("CARGO_PKG_VERSION"));
    server.serve()?;
    Ok(())
}
