//! Client-side NBD handshake
//!
//! Runs once per connection generation, before any request is framed.
//! Fixed-newstyle servers are asked with `NBD_OPT_GO`; servers that answer
//! `NBD_REP_ERR_UNSUP` get the legacy `NBD_OPT_EXPORT_NAME`. Old-style
//! servers announce the export directly in the greeting.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{
    ClientFlags, EXPORT_NAME_PADDING, ExportInfo, GlobalFlags, NBD_CLISERV_MAGIC,
    NBD_INFO_BLOCK_SIZE, NBD_INFO_EXPORT, NBD_INIT_MAGIC, NBD_OPTS_MAGIC, NBD_REP_MAGIC,
    NbdOption, NbdReplyType, TransmissionFlags,
};
use crate::error::{BlockError, BlockResult};

/// Upper bound on an option reply payload
const MAX_OPTION_REPLY: u32 = 64 * 1024;

/// Negotiate `export_name` with the server on `stream`
pub async fn negotiate<S>(stream: &mut S, export_name: &str) -> BlockResult<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = stream.read_u64().await?;
    if magic != NBD_INIT_MAGIC {
        return Err(BlockError::Protocol(format!(
            "Invalid greeting magic: {:016x}",
            magic
        )));
    }

    let style = stream.read_u64().await?;
    match style {
        NBD_CLISERV_MAGIC => oldstyle(stream, export_name).await,
        NBD_OPTS_MAGIC => newstyle(stream, export_name).await,
        other => Err(BlockError::Protocol(format!(
            "Unknown handshake style: {:016x}",
            other
        ))),
    }
}

async fn oldstyle<S>(stream: &mut S, export_name: &str) -> BlockResult<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let size = stream.read_u64().await?;
    let flags = stream.read_u32().await?;
    let mut padding = [0u8; EXPORT_NAME_PADDING];
    stream.read_exact(&mut padding).await?;

    debug!("Old-style server: size={} flags={:08x}", size, flags);
    Ok(ExportInfo::new(export_name, size).with_flags(TransmissionFlags::new(flags as u16)))
}

async fn newstyle<S>(stream: &mut S, export_name: &str) -> BlockResult<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let global = GlobalFlags::new(stream.read_u16().await?);
    let client = ClientFlags::for_server(global);
    stream.write_u32(client.bits()).await?;
    stream.flush().await?;
    debug!(
        "Server handshake flags {:04x}, replying {:08x}",
        global.bits(),
        client.bits()
    );

    if global.fixed_newstyle() {
        if let Some(export) = option_go(stream, export_name).await? {
            return Ok(export);
        }
        debug!("Server does not support NBD_OPT_GO, falling back to EXPORT_NAME");
    }

    option_export_name(stream, export_name, global.no_zeroes()).await
}

async fn send_option<S>(stream: &mut S, option: NbdOption, data: &[u8]) -> BlockResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 + data.len());
    buf.put_u64(NBD_OPTS_MAGIC);
    buf.put_u32(option as u32);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    trace!("Sent option {:?} ({} bytes)", option, data.len());
    Ok(())
}

/// `Ok(None)` means the server does not implement `NBD_OPT_GO`
async fn option_go<S>(stream: &mut S, export_name: &str) -> BlockResult<Option<ExportInfo>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = export_name.as_bytes();
    let mut data = BytesMut::with_capacity(8 + name.len());
    data.put_u32(name.len() as u32);
    data.put_slice(name);
    data.put_u16(1);
    data.put_u16(NBD_INFO_BLOCK_SIZE);
    send_option(stream, NbdOption::Go, &data).await?;

    let mut size_and_flags: Option<(u64, TransmissionFlags)> = None;
    let mut block_sizes: Option<(u32, u32, u32)> = None;

    loop {
        let magic = stream.read_u64().await?;
        if magic != NBD_REP_MAGIC {
            return Err(BlockError::Protocol(format!(
                "Invalid option reply magic: {:016x}",
                magic
            )));
        }
        let option = stream.read_u32().await?;
        if option != NbdOption::Go as u32 {
            return Err(BlockError::Protocol(format!(
                "Reply for option {} while waiting for GO",
                option
            )));
        }
        let raw_type = stream.read_u32().await?;
        let len = stream.read_u32().await?;
        if len > MAX_OPTION_REPLY {
            return Err(BlockError::Protocol(format!(
                "Option reply too large: {} bytes",
                len
            )));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;

        if NbdReplyType::is_error_code(raw_type) {
            return match NbdReplyType::try_from(raw_type) {
                Ok(NbdReplyType::ErrUnsup) => Ok(None),
                Ok(NbdReplyType::ErrUnknown) => Err(BlockError::InvalidArgument(format!(
                    "Server has no export named {:?}",
                    export_name
                ))),
                _ => Err(BlockError::Protocol(format!(
                    "Server rejected export {:?} ({:08x}): {}",
                    export_name,
                    raw_type,
                    String::from_utf8_lossy(&payload)
                ))),
            };
        }

        match NbdReplyType::try_from(raw_type)? {
            NbdReplyType::Ack => break,
            NbdReplyType::Info => {
                let mut info = payload.as_slice();
                if info.len() < 2 {
                    return Err(BlockError::Protocol("Empty NBD_REP_INFO".to_string()));
                }
                match info.get_u16() {
                    NBD_INFO_EXPORT if info.len() >= 10 => {
                        let size = info.get_u64();
                        let flags = TransmissionFlags::new(info.get_u16());
                        size_and_flags = Some((size, flags));
                    }
                    NBD_INFO_BLOCK_SIZE if info.len() >= 12 => {
                        block_sizes = Some((info.get_u32(), info.get_u32(), info.get_u32()));
                    }
                    NBD_INFO_EXPORT | NBD_INFO_BLOCK_SIZE => {
                        return Err(BlockError::Protocol("Truncated NBD_REP_INFO".to_string()));
                    }
                    other => trace!("Ignoring NBD_INFO type {}", other),
                }
            }
            other => trace!("Ignoring option reply {:?}", other),
        }
    }

    let (size, flags) = size_and_flags.ok_or_else(|| {
        BlockError::Protocol("GO acknowledged without NBD_INFO_EXPORT".to_string())
    })?;

    let mut export = ExportInfo::new(export_name, size).with_flags(flags);
    if let Some((min, preferred, max)) = block_sizes {
        if min == 0 || max < min {
            return Err(BlockError::Protocol(format!(
                "Invalid block size constraints: min={} preferred={} max={}",
                min, preferred, max
            )));
        }
        export = export.block_sizes(min, preferred, max);
    }

    debug!(
        "Negotiated export {:?} via GO: size={} flags={:04x}",
        export_name,
        size,
        flags.bits()
    );
    Ok(Some(export))
}

async fn option_export_name<S>(
    stream: &mut S,
    export_name: &str,
    no_zeroes: bool,
) -> BlockResult<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_option(stream, NbdOption::ExportName, export_name.as_bytes()).await?;

    let size = stream.read_u64().await?;
    let flags = TransmissionFlags::new(stream.read_u16().await?);
    if !no_zeroes {
        let mut padding = [0u8; EXPORT_NAME_PADDING];
        stream.read_exact(&mut padding).await?;
    }

    debug!(
        "Negotiated export {:?} via EXPORT_NAME: size={} flags={:04x}",
        export_name,
        size,
        flags.bits()
    );
    Ok(ExportInfo::new(export_name, size).with_flags(flags))
}
