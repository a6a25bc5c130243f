use clap::Parser;
use webspace::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    std::process::exit(cli::run(cli));
}
