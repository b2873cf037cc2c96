//! CLI command implementations

pub mod io;
pub mod probe;

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};
use warp_nbd::{ClientConfig, ControlCommand, ControlReply, DeviceTable, ExportInfo, Minor, OwnerId};

/// Device slot every command drives
pub const MINOR: Minor = 0;

/// Load the client configuration, layering env overrides and CLI flags on top
pub fn load_config(path: Option<&Path>, export: Option<String>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    let mut config = config.apply_env_overrides()?;
    if let Some(export) = export {
        config.export_name = export;
    }
    // One device is all a command needs
    config.devices = 1;
    config.validate()?;
    Ok(config)
}

/// An open, connected device
pub struct Attached {
    /// Table holding the single device
    pub table: DeviceTable,
    /// Export negotiated with the server
    pub export: std::sync::Arc<ExportInfo>,
    owner: OwnerId,
}

impl Attached {
    /// Resolve `server`, open the device and wait for the handshake
    pub async fn connect(config: ClientConfig, server: &str) -> Result<Self> {
        let remote = resolve(server).await?;
        let timeout = config.connect_timeout_duration() + config.handshake_timeout_duration();

        let table = DeviceTable::new(config)?;
        let owner = OwnerId::from_raw(u64::from(std::process::id()));
        table.open(MINOR, owner)?;

        match table.control(MINOR, ControlCommand::Connect(remote))? {
            ControlReply::Connecting(token) => {
                debug!("Connect started (generation {})", token.generation())
            }
            other => bail!("unexpected connect reply: {:?}", other),
        }

        let export = table
            .wait_ready_timeout(MINOR, timeout)
            .await
            .with_context(|| format!("connecting to {}", remote))?;
        info!("Connected to {} ({} bytes)", remote, export.size);

        Ok(Self {
            table,
            export,
            owner,
        })
    }

    /// Apply a block size override through the control surface
    pub fn set_block_size(&self, size: Option<u32>) -> Result<u32> {
        if let Some(size) = size {
            self.table.control(MINOR, ControlCommand::SetBlockSize(size))?;
        }
        match self.table.control(MINOR, ControlCommand::GetBlockSize)? {
            ControlReply::BlockSize(size) => Ok(size),
            other => bail!("unexpected block size reply: {:?}", other),
        }
    }

    /// Disconnect and release the device
    pub fn detach(self) -> Result<()> {
        self.table.control(MINOR, ControlCommand::Disconnect)?;
        self.table.close(MINOR, self.owner)?;
        Ok(())
    }
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("resolving {}", server))?
        .next()
        .with_context(|| format!("no address for {}", server))
}
