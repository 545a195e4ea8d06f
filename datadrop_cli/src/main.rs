use anyhow::Result;
use clap::Parser;
use datadrop_core::ClientConfig;

mod commands;
mod output;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut config = ClientConfig::load();
    config.apply_relay_override(cli.relay);

    match cli.command {
        Command::Info => commands::info(&config).await,
        Command::Send(args) => commands::send(&config, args).await,
        Command::Receive(args) => commands::receive(&config, args).await,
        Command::Config(args) => commands::config(args),
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,datadrop=info,datadrop_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
