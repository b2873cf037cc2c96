//! probe command - connect and describe an export

use anyhow::{Result, bail};
use warp_nbd::{ClientConfig, ControlCommand, ControlReply};

use super::{Attached, MINOR};

/// Execute the probe command
pub async fn execute(config: ClientConfig, server: &str) -> Result<()> {
    let attached = Attached::connect(config, server).await?;
    let export = attached.export.clone();

    let block_size = attached.set_block_size(None)?;
    let blocks = match attached.table.control(MINOR, ControlCommand::GetBlockCount)? {
        ControlReply::BlockCount(count) => count,
        other => bail!("unexpected block count reply: {:?}", other),
    };

    println!("warp-nbd - Export Information");
    println!("{}", "=".repeat(60));
    println!();
    println!("  Server:           {}", server);
    if !export.name.is_empty() {
        println!("  Export:           {}", export.name);
    }
    println!("  Size:             {} bytes", export.size);
    println!("  Blocks:           {} x {} bytes", blocks, block_size);
    println!(
        "  Block sizes:      min {} / preferred {} / max {}",
        export.min_block_size, export.preferred_block_size, export.max_block_size
    );
    println!("  Flags:            {:#06x}", export.flags.bits());
    println!("  Read-only:        {}", export.flags.is_read_only());
    println!("  Flush:            {}", export.flags.can_flush());
    println!("  Trim:             {}", export.flags.can_trim());

    attached.detach()
}
