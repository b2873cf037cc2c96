//! read and write commands - move blocks between a file and an export

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use tracing::info;
use warp_nbd::ClientConfig;

use super::{Attached, MINOR};

const HEX_WIDTH: usize = 16;

/// Read `count` blocks starting at `block`
pub async fn read(
    config: ClientConfig,
    server: &str,
    block: u64,
    count: u64,
    block_size: Option<u32>,
    output: Option<&Path>,
) -> Result<()> {
    let attached = Attached::connect(config, server).await?;
    let size = attached.set_block_size(block_size)?;

    let len = count
        .checked_mul(u64::from(size))
        .and_then(|len| usize::try_from(len).ok())
        .context("read length overflows")?;
    let data = attached.table.read_blocks(MINOR, block, len).await?;
    info!("Read {} bytes from block {}", data.len(), block);

    match output {
        Some(path) => tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => hexdump(&data, block * u64::from(size))?,
    }

    attached.detach()
}

/// Write the contents of `input` starting at `block`
pub async fn write(
    config: ClientConfig,
    server: &str,
    block: u64,
    block_size: Option<u32>,
    input: &Path,
    flush: bool,
) -> Result<()> {
    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    let attached = Attached::connect(config, server).await?;
    let size = attached.set_block_size(block_size)?;
    if data.is_empty() || data.len() % size as usize != 0 {
        bail!(
            "{} is {} bytes, not a whole number of {} byte blocks",
            input.display(),
            data.len(),
            size
        );
    }

    let written = attached
        .table
        .write_blocks(MINOR, block, BytesMut::from(&data[..]))
        .await?;
    info!("Wrote {} bytes at block {}", written, block);

    if flush {
        attached.table.flush(MINOR).await.result?;
    }

    attached.detach()
}

fn hexdump(data: &[u8], base: u64) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (i, chunk) in data.chunks(HEX_WIDTH).enumerate() {
        write!(out, "{:010x}:", base + (i * HEX_WIDTH) as u64)?;
        for byte in chunk {
            write!(out, " {:02x}", byte)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
