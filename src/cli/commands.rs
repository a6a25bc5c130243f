use super::render::{ask, find_image, progress, render_config, render_images, render_status};
use super::{Cli, Command, ConfigAction};
use crate::console::{self, ProxyExit};
use crate::daemon::client::RpcClient;
use crate::signal::Cancellation;
use crate::terminal;
use anyhow::{bail, Result};
use std::io;

/// Run a parsed command line; returns the process exit code
pub fn run(cli: Cli) -> i32 {
    match execute(&client_for(&cli), &cli.command) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Build the client, dropping a `--user` that names the caller
fn client_for(cli: &Cli) -> RpcClient {
    let user = cli
        .user
        .clone()
        .filter(|u| *u != whoami::username());
    if let Some(user) = &user {
        log::debug!("Requesting to act as {}", user);
    }
    RpcClient::new(&cli.socket_path).impersonating(user)
}

pub fn execute(client: &RpcClient, command: &Command) -> Result<()> {
    match command {
        Command::Images => print!("{}", render_images(&client.images()?)),
        Command::Init { image } => init(client, image)?,
        Command::Status => print!("{}", render_status(&client.status()?)),
        Command::Log => println!("{}", client.log()?),
        Command::Console => attach_console(client)?,
        Command::Shutdown => progress("Shutting your container down...", " done.", || client.shutdown())?,
        Command::Reboot => progress("Rebooting your container...", " done.", || client.reboot())?,
        Command::Delete { yes } => delete(client, *yes)?,
        Command::Config { action } => match action {
            None | Some(ConfigAction::Show) => print!("{}", render_config(&client.get_config()?)),
            Some(ConfigAction::Set { key, value }) => client.set_option(key, value)?,
            Some(ConfigAction::Unset { key }) => client.unset_option(key)?,
        },
    }
    Ok(())
}

fn init(client: &RpcClient, image: &str) -> Result<()> {
    progress("Creating your container...", " success!", || {
        let images = client.images()?;
        let Some(found) = find_image(&images, image) else {
            bail!("\"{}\" is not a valid image alias / fingerprint", image);
        };
        client.init(&found.fingerprint)?;
        Ok(())
    })
}

fn delete(client: &RpcClient, confirmed: bool) -> Result<()> {
    if !confirmed {
        let stdin = io::stdin();
        if !ask("Are you sure?", Some(false), &mut stdin.lock(), &mut io::stdout())? {
            return Ok(());
        }
    }
    progress("Deleting your container...", " done.", || client.delete())?;
    Ok(())
}

fn attach_console(client: &RpcClient) -> Result<()> {
    if !terminal::stdin_is_terminal() {
        bail!("The console needs an interactive terminal");
    }

    println!("Attaching to console...");
    let (width, height) = terminal::dimensions();
    let session = client.console(width, height)?;
    log::debug!("Console session at {}", session.display());

    let cancel = Cancellation::new()?;
    println!("Attached, hit ^] (Ctrl+]) and then q to disconnect");

    let exit = console::attach(client, &session, &cancel)?;
    match exit {
        ProxyExit::Detached => println!("\r\nDetached from console"),
        ProxyExit::RemoteClosed => println!("\r\nConsole closed by the container"),
        ProxyExit::Cancelled => println!("\r\nInterrupted, detached from console"),
        ProxyExit::InputClosed => println!("\r\nInput closed, detached from console"),
    }
    Ok(())
}
