//! warp-nbd - NBD block device client

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warp_nbd_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = warp_nbd_cli::commands::load_config(cli.config.as_deref(), cli.export)?;

    match cli.command {
        Commands::Probe { server } => warp_nbd_cli::commands::probe::execute(config, &server).await,
        Commands::Read {
            server,
            block,
            count,
            block_size,
            output,
        } => {
            warp_nbd_cli::commands::io::read(config, &server, block, count, block_size, output.as_deref())
                .await
        }
        Commands::Write {
            server,
            block,
            block_size,
            input,
            flush,
        } => warp_nbd_cli::commands::io::write(config, &server, block, block_size, &input, flush).await,
    }
}
