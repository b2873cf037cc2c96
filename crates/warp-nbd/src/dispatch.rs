//! Block I/O dispatch
//!
//! Turns block-addressed requests into NBD commands on the device's current
//! session. Submission never blocks: every request gets a [`PendingIo`]
//! that resolves exactly once, carrying the caller's buffer back with the
//! outcome. Requests that fail validation resolve immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::sync::oneshot;
use tracing::trace;

use crate::device::{Device, DeviceTable, Minor};
use crate::error::{BlockError, BlockResult};
use crate::nbd::session::{Request, Session};
use crate::nbd::{ExportInfo, NbdCommand};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to caller
    Read,
    /// Caller to server
    Write,
}

/// A block I/O request.
///
/// The byte count is the buffer length. For reads the buffer is the
/// destination and its contents are overwritten; for writes it is the
/// source.
#[derive(Debug)]
pub struct BlockIo {
    /// Transfer direction
    pub direction: Direction,
    /// First block, in units of the device's block size
    pub start_block: u64,
    /// Data area
    pub buffer: BytesMut,
}

impl BlockIo {
    /// Read `len` bytes starting at `start_block`
    pub fn read(start_block: u64, len: usize) -> Self {
        Self {
            direction: Direction::Read,
            start_block,
            buffer: BytesMut::zeroed(len),
        }
    }

    /// Write `data` starting at `start_block`
    pub fn write(start_block: u64, data: BytesMut) -> Self {
        Self {
            direction: Direction::Write,
            start_block,
            buffer: data,
        }
    }
}

/// Outcome of one request
#[derive(Debug)]
pub struct IoCompletion {
    /// The caller's buffer, returned exactly once
    pub buffer: BytesMut,
    /// Bytes transferred, or the failure
    pub result: BlockResult<usize>,
}

impl IoCompletion {
    /// Return the buffer on success
    pub fn into_result(self) -> BlockResult<BytesMut> {
        self.result.map(|_| self.buffer)
    }
}

/// Single-shot completion of a submitted request
#[derive(Debug)]
pub struct PendingIo {
    rx: oneshot::Receiver<IoCompletion>,
}

impl PendingIo {
    fn channel() -> (oneshot::Sender<IoCompletion>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn rejected(buffer: BytesMut, err: BlockError) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(IoCompletion {
            buffer,
            result: Err(err),
        });
        pending
    }
}

impl Future for PendingIo {
    type Output = IoCompletion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|completion| {
            // The sender side always completes before it is dropped
            completion.unwrap_or_else(|_| IoCompletion {
                buffer: BytesMut::new(),
                result: Err(BlockError::ConnectionClosed),
            })
        })
    }
}

/// Session and negotiated parameters captured under the device lock
struct Transmission {
    session: Arc<Session>,
    export: Arc<ExportInfo>,
    block_size: u32,
}

impl Transmission {
    fn byte_range(&self, start_block: u64, length: u64) -> BlockResult<(u64, u32)> {
        byte_range(start_block, length, self.block_size, self.export.size)
    }
}

impl Device {
    fn transmission(&self) -> BlockResult<Transmission> {
        let state = self.lock();
        match (&state.session, &state.export) {
            (Some(session), Some(export)) if state.connect_completed && state.size.is_some() => {
                Ok(Transmission {
                    session: session.clone(),
                    export: export.clone(),
                    block_size: state.client_block_size,
                })
            }
            _ => Err(BlockError::NotReady {
                minor: self.minor(),
            }),
        }
    }

    /// Requests awaiting a reply on the current connection
    pub fn inflight(&self) -> usize {
        self.lock().session.as_ref().map_or(0, |s| s.pending())
    }
}

/// Byte range starting at `start_block`, checked against the export size
fn byte_range(start_block: u64, length: u64, block_size: u32, size: u64) -> BlockResult<(u64, u32)> {
    let offset = start_block.checked_mul(block_size as u64).ok_or_else(|| {
        BlockError::InvalidArgument(format!(
            "block {} overflows the byte address space",
            start_block
        ))
    })?;

    if length == 0 || length > u32::MAX as u64 {
        return Err(BlockError::InvalidLength { length });
    }
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok((offset, length as u32)),
        _ => Err(BlockError::InvalidOffset { offset, size }),
    }
}

impl DeviceTable {
    /// Submit a block I/O request
    pub fn submit(&self, minor: Minor, io: BlockIo) -> PendingIo {
        let device = match self.lookup(minor) {
            Ok(device) => device,
            Err(e) => return PendingIo::rejected(io.buffer, e),
        };

        let command = match io.direction {
            Direction::Read => NbdCommand::Read,
            Direction::Write => NbdCommand::Write,
        };

        let prepared = device.transmission().and_then(|transmission| {
            let length = io.buffer.len() as u64;
            let export = &transmission.export;
            if length > export.max_block_size as u64
                || length % export.min_block_size.max(1) as u64 != 0
            {
                return Err(BlockError::InvalidLength { length });
            }
            if command == NbdCommand::Write && export.flags.is_read_only() {
                return Err(BlockError::ReadOnly);
            }
            let (offset, length) = transmission.byte_range(io.start_block, length)?;
            Ok((transmission.session, offset, length))
        });

        match prepared {
            Ok((session, offset, length)) => {
                trace!(
                    "Device {} {:?} block={} offset={} len={}",
                    minor, io.direction, io.start_block, offset, length
                );
                let (done, pending) = PendingIo::channel();
                session.submit(Request {
                    command,
                    offset,
                    length,
                    buffer: io.buffer,
                    done,
                });
                pending
            }
            Err(e) => {
                device.counters.record_rejected();
                PendingIo::rejected(io.buffer, e)
            }
        }
    }

    /// Flush the server's write cache
    pub fn flush(&self, minor: Minor) -> PendingIo {
        let device = match self.lookup(minor) {
            Ok(device) => device,
            Err(e) => return PendingIo::rejected(BytesMut::new(), e),
        };

        let prepared = device.transmission().and_then(|transmission| {
            if !transmission.export.flags.can_flush() {
                return Err(BlockError::Unsupported(
                    "export does not accept flush".to_string(),
                ));
            }
            Ok(transmission.session)
        });

        match prepared {
            Ok(session) => {
                let (done, pending) = PendingIo::channel();
                session.submit(Request {
                    command: NbdCommand::Flush,
                    offset: 0,
                    length: 0,
                    buffer: BytesMut::new(),
                    done,
                });
                pending
            }
            Err(e) => {
                device.counters.record_rejected();
                PendingIo::rejected(BytesMut::new(), e)
            }
        }
    }

    /// Discard `block_count` blocks from `start_block`
    pub fn trim(&self, minor: Minor, start_block: u64, block_count: u64) -> PendingIo {
        let device = match self.lookup(minor) {
            Ok(device) => device,
            Err(e) => return PendingIo::rejected(BytesMut::new(), e),
        };

        let prepared = device.transmission().and_then(|transmission| {
            let flags = transmission.export.flags;
            if !flags.can_trim() {
                return Err(BlockError::Unsupported(
                    "export does not accept trim".to_string(),
                ));
            }
            if flags.is_read_only() {
                return Err(BlockError::ReadOnly);
            }
            let length = block_count
                .checked_mul(transmission.block_size as u64)
                .ok_or(BlockError::InvalidLength { length: u64::MAX })?;
            let (offset, length) = transmission.byte_range(start_block, length)?;
            Ok((transmission.session, offset, length))
        });

        match prepared {
            Ok((session, offset, length)) => {
                let (done, pending) = PendingIo::channel();
                session.submit(Request {
                    command: NbdCommand::Trim,
                    offset,
                    length,
                    buffer: BytesMut::new(),
                    done,
                });
                pending
            }
            Err(e) => {
                device.counters.record_rejected();
                PendingIo::rejected(BytesMut::new(), e)
            }
        }
    }

    /// Read `len` bytes starting at `start_block`
    pub async fn read_blocks(&self, minor: Minor, start_block: u64, len: usize) -> BlockResult<BytesMut> {
        self.submit(minor, BlockIo::read(start_block, len))
            .await
            .into_result()
    }

    /// Write `data` starting at `start_block`, returning bytes written
    pub async fn write_blocks(&self, minor: Minor, start_block: u64, data: BytesMut) -> BlockResult<usize> {
        self.submit(minor, BlockIo::write(start_block, data))
            .await
            .result
    }
}
