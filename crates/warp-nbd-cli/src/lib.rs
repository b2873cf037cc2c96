//! warp-nbd-cli library exports
//!
//! Argument definitions and command implementations for the `warp-nbd`
//! operator binary.

pub mod commands;

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "warp-nbd")]
#[command(author, version, about = "Drive warp-nbd devices against an NBD server", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Client configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Export name to request (overrides the configuration file)
    #[arg(short, long, global = true)]
    pub export: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Connect, negotiate and report what the server exports
    Probe {
        /// NBD server address (host:port)
        server: String,
    },
    /// Read blocks from an export
    Read {
        /// NBD server address (host:port)
        server: String,
        /// First block to read
        #[arg(short, long, default_value = "0")]
        block: u64,
        /// Number of blocks to read
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u32>,
        /// Write the data to this file instead of a hex dump on stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a file to an export
    Write {
        /// NBD server address (host:port)
        server: String,
        /// First block to write
        #[arg(short, long, default_value = "0")]
        block: u64,
        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u32>,
        /// File to write; its length must be a whole number of blocks
        input: PathBuf,
        /// Flush after writing
        #[arg(long)]
        flush: bool,
    },
}
