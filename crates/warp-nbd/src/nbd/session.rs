//! Transmission-phase session
//!
//! One session per connection generation. Frames are queued on an
//! unbounded channel and written by a single writer task, so frames from
//! concurrent submitters never interleave. A single reader task matches
//! replies to in-flight requests by handle.
//!
//! Once a session is closed, frames still queued are discarded rather than
//! written: their requests have already completed with `ConnectionClosed`.
//! While requests are outstanding, the reader expects progress within the
//! I/O timeout and tears the generation down otherwise.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{NbdCommand, NbdReply, NbdRequest};
use crate::config::ClientConfig;
use crate::connect::BoxedStream;
use crate::device::{Device, Minor};
use crate::dispatch::IoCompletion;
use crate::error::{BlockError, BlockResult};
use crate::stats::StatsCounters;

/// A validated request ready to be framed
pub(crate) struct Request {
    pub(crate) command: NbdCommand,
    pub(crate) offset: u64,
    pub(crate) length: u32,
    pub(crate) buffer: BytesMut,
    pub(crate) done: oneshot::Sender<IoCompletion>,
}

/// Outstanding request awaiting its reply.
///
/// Completes exactly once: either explicitly, or with `ConnectionClosed`
/// when dropped.
struct Inflight {
    command: NbdCommand,
    length: u32,
    buffer: BytesMut,
    done: Option<oneshot::Sender<IoCompletion>>,
    counters: Arc<StatsCounters>,
}

impl Inflight {
    fn complete(&mut self, result: BlockResult<usize>) {
        let Some(done) = self.done.take() else {
            return;
        };

        match (&result, self.command) {
            (Ok(n), NbdCommand::Read) => self.counters.record_read(*n as u64),
            (Ok(n), NbdCommand::Write) => self.counters.record_write(*n as u64),
            (Ok(_), NbdCommand::Flush) => self.counters.record_flush(),
            (Ok(_), NbdCommand::Trim) => self.counters.record_trim(),
            (Ok(_), NbdCommand::Disc) => {}
            (Err(_), NbdCommand::Read) => self.counters.record_read_error(),
            (Err(_), _) => self.counters.record_write_error(),
        }

        // Receiver may have given up; the buffer goes with it
        let _ = done.send(IoCompletion {
            buffer: std::mem::take(&mut self.buffer),
            result,
        });
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.complete(Err(BlockError::ConnectionClosed));
    }
}

enum Outbound {
    Frame(Bytes),
    /// Send `NBD_CMD_DISC` and shut the write side down
    Disconnect(Bytes),
    /// Stop without writing anything further
    Close,
}

struct InflightTable {
    closed: bool,
    requests: HashMap<u64, Inflight>,
    reader: Option<AbortHandle>,
    /// Last time the reader made progress while requests were outstanding
    busy_since: Option<Instant>,
}

/// Transmission state for one connection generation
pub(crate) struct Session {
    minor: Minor,
    generation: u64,
    next_handle: AtomicU64,
    inflight: Mutex<InflightTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Set by `close`: queued frames are dropped instead of written
    discarding: AtomicBool,
    io_timeout: Duration,
    counters: Arc<StatsCounters>,
}

impl Session {
    /// Split `stream` and spawn the writer and reader tasks
    pub(crate) fn start(
        device: Arc<Device>,
        generation: u64,
        stream: BoxedStream,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            minor: device.minor(),
            generation,
            next_handle: AtomicU64::new(1),
            inflight: Mutex::new(InflightTable {
                closed: false,
                requests: HashMap::new(),
                reader: None,
                busy_since: None,
            }),
            outbound: tx,
            discarding: AtomicBool::new(false),
            io_timeout: config.io_timeout_duration(),
            counters: device.counters.clone(),
        });

        let writer = BufWriter::with_capacity(config.write_buffer_size, write_half);
        tokio::spawn(write_loop(session.clone(), device.clone(), writer, rx));
        let reader = tokio::spawn(read_loop(session.clone(), device, read_half));

        let mut table = session.inflight.lock();
        if table.closed {
            reader.abort();
        } else {
            table.reader = Some(reader.abort_handle());
        }
        drop(table);

        debug!(
            "Started session for device {} generation {}",
            session.minor, generation
        );
        session
    }

    /// Number of requests awaiting a reply
    pub(crate) fn pending(&self) -> usize {
        self.inflight.lock().requests.len()
    }

    /// Frame and queue a request. Never blocks; the outcome arrives on
    /// the request's completion channel.
    pub(crate) fn submit(&self, request: Request) {
        let Request {
            command,
            offset,
            length,
            buffer,
            done,
        } = request;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let payload = if command == NbdCommand::Write {
            length as usize
        } else {
            0
        };

        let mut frame = BytesMut::with_capacity(NbdRequest::SIZE + payload);
        NbdRequest::new(command, handle, offset, length).encode(&mut frame);
        if payload > 0 {
            frame.put_slice(&buffer[..payload]);
        }

        let inflight = Inflight {
            command,
            length,
            buffer,
            done: Some(done),
            counters: self.counters.clone(),
        };

        {
            let mut table = self.inflight.lock();
            if table.closed {
                drop(table);
                drop(inflight);
                return;
            }
            if table.requests.is_empty() {
                table.busy_since = Some(Instant::now());
            }
            table.requests.insert(handle, inflight);
        }

        trace!(
            "Queued {:?} handle={:#x} offset={} len={}",
            command, handle, offset, length
        );

        if self.outbound.send(Outbound::Frame(frame.freeze())).is_err() {
            let orphan = self.inflight.lock().requests.remove(&handle);
            drop(orphan);
        }
    }

    fn take(&self, handle: u64) -> Option<Inflight> {
        let mut table = self.inflight.lock();
        let inflight = table.requests.remove(&handle);
        table.busy_since = if table.requests.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        inflight
    }

    /// When the reader must next hear from the server, if anything is
    /// outstanding
    fn reply_deadline(&self) -> Option<Instant> {
        self.inflight
            .lock()
            .busy_since
            .map(|since| since + self.io_timeout)
    }

    /// Fail every outstanding request with `ConnectionClosed` and stop the
    /// tasks. A graceful close sends `NBD_CMD_DISC` first. Idempotent.
    pub(crate) fn close(&self, graceful: bool) {
        let (requests, reader) = {
            let mut table = self.inflight.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            table.busy_since = None;
            self.discarding.store(true, Ordering::Release);
            let requests: Vec<Inflight> = table.requests.drain().map(|(_, r)| r).collect();
            (requests, table.reader.take())
        };

        let failed = requests.len();
        // Dropping completes each with ConnectionClosed
        drop(requests);

        if let Some(reader) = reader {
            reader.abort();
        }

        let farewell = if graceful {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            let mut frame = BytesMut::with_capacity(NbdRequest::SIZE);
            NbdRequest::new(NbdCommand::Disc, handle, 0, 0).encode(&mut frame);
            Outbound::Disconnect(frame.freeze())
        } else {
            Outbound::Close
        };
        let _ = self.outbound.send(farewell);

        debug!(
            "Closed session for device {} generation {} ({} requests failed)",
            self.minor, self.generation, failed
        );
    }

    /// Tear down after a transport or protocol failure
    fn fail(&self, device: &Device, err: BlockError) {
        device.drop_generation(self.generation, &err);
        self.close(false);
    }

    async fn receive<R>(&self, reader: &mut R) -> BlockResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; NbdReply::SIZE];
        loop {
            self.read_header(reader, &mut header).await?;
            let reply = NbdReply::parse(&header)?;

            let mut inflight = self.take(reply.handle).ok_or_else(|| {
                BlockError::Protocol(format!("Reply for unknown handle {:#x}", reply.handle))
            })?;

            trace!(
                "Reply handle={:#x} error={} for {:?}",
                reply.handle, reply.error, inflight.command
            );

            if !reply.error.is_ok() {
                inflight.complete(Err(BlockError::IoFailure(reply.error)));
                continue;
            }

            let length = inflight.length as usize;
            if inflight.command == NbdCommand::Read {
                tokio::time::timeout(
                    self.io_timeout,
                    reader.read_exact(&mut inflight.buffer[..length]),
                )
                .await
                .map_err(|_| BlockError::Timeout("read reply payload".to_string()))??;
            }
            inflight.complete(Ok(length));
        }
    }

    /// Fill `header`, failing when requests are outstanding and the server
    /// goes quiet past the I/O timeout. An idle connection may stay quiet.
    async fn read_header<R>(&self, reader: &mut R, header: &mut [u8]) -> BlockResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut filled = 0;
        while filled < header.len() {
            let deadline = self
                .reply_deadline()
                .unwrap_or_else(|| Instant::now() + self.io_timeout);

            // A cancelled `read` consumes nothing, so retrying is safe
            match tokio::time::timeout_at(deadline, reader.read(&mut header[filled..])).await {
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let overdue = self
                        .reply_deadline()
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if overdue {
                        return Err(BlockError::Timeout(format!(
                            "no reply within {:?}",
                            self.io_timeout
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

async fn read_loop<R>(session: Arc<Session>, device: Arc<Device>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    if let Err(e) = session.receive(&mut reader).await {
        session.fail(&device, e);
    }
}

async fn write_loop<W>(
    session: Arc<Session>,
    device: Arc<Device>,
    mut writer: BufWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let pumped = pump_frames(&mut writer, &mut rx, &session.discarding, session.io_timeout).await;
    if let Err(e) = pumped {
        session.fail(&device, e);
    }
}

async fn pump_frames<W>(
    writer: &mut BufWriter<W>,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    discarding: &AtomicBool,
    io_timeout: Duration,
) -> BlockResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut dropped = 0usize;
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        // Drain whatever is already queued before flushing
        while let Some(message) = next.take() {
            match message {
                Outbound::Frame(_) if discarding.load(Ordering::Acquire) => dropped += 1,
                Outbound::Frame(frame) => write_frame(writer, &frame, io_timeout).await?,
                Outbound::Disconnect(frame) => {
                    if dropped > 0 {
                        debug!("Discarded {} frames queued before close", dropped);
                    }
                    write_frame(writer, &frame, io_timeout).await?;
                    flush(writer, io_timeout).await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
                Outbound::Close => {
                    if dropped > 0 {
                        debug!("Discarded {} frames queued before close", dropped);
                    }
                    return Ok(());
                }
            }
            next = rx.try_recv().ok();
        }
        flush(writer, io_timeout).await?;
    }
    Ok(())
}

async fn write_frame<W>(writer: &mut BufWriter<W>, frame: &[u8], io_timeout: Duration) -> BlockResult<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(io_timeout, writer.write_all(frame))
        .await
        .map_err(|_| BlockError::Timeout("socket write".to_string()))??;
    Ok(())
}

async fn flush<W>(writer: &mut BufWriter<W>, io_timeout: Duration) -> BlockResult<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(io_timeout, writer.flush())
        .await
        .map_err(|_| BlockError::Timeout("socket flush".to_string()))??;
    Ok(())
}
