//! In-process NBD server for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use warp_nbd::nbd::{
    ClientFlags, GlobalFlags, NBD_INFO_BLOCK_SIZE, NBD_INFO_EXPORT, NBD_INIT_MAGIC,
    NBD_OPTS_MAGIC, NBD_REP_MAGIC, NbdCommand, NbdOption, NbdReply, NbdReplyType, NbdRequest,
    TransmissionFlags,
};
use warp_nbd::{ClientConfig, DeviceTable, NbdError};

/// How the server treats each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Serve everything
    Normal,
    /// Answer `NBD_OPT_GO` with `NBD_REP_ERR_UNSUP`
    NoGo,
    /// Reply to the first `reply_first` requests, then drop the connection
    /// once `after` requests have arrived
    Sever { after: usize, reply_first: usize },
    /// Reply to the first request with a handle nobody sent
    WrongHandle,
    /// Fail reads at this byte offset with EIO
    FailReadsAt(u64),
    /// Accept the connection and never send a greeting
    Silent,
    /// Negotiate, then read requests without ever replying
    NoReplies,
}

/// Loopback NBD server backed by memory
pub struct TestServer {
    addr: SocketAddr,
    data: Arc<Mutex<Vec<u8>>>,
    requests: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct Shared {
    size: u64,
    flags: u16,
    min_block_size: u32,
    behavior: Behavior,
    data: Arc<Mutex<Vec<u8>>>,
    requests: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(size: u64, behavior: Behavior) -> Self {
        let flags = TransmissionFlags::HAS_FLAGS
            | TransmissionFlags::SEND_FLUSH
            | TransmissionFlags::SEND_TRIM;
        Self::start_with_flags(size, flags, behavior).await
    }

    pub async fn start_with_flags(size: u64, flags: u16, behavior: Behavior) -> Self {
        Self::spawn(size, flags, 1, behavior).await
    }

    /// Advertise `min_block_size` in `NBD_INFO_BLOCK_SIZE`
    pub async fn start_with_min_block_size(size: u64, min_block_size: u32, behavior: Behavior) -> Self {
        let flags = TransmissionFlags::HAS_FLAGS | TransmissionFlags::SEND_FLUSH;
        Self::spawn(size, flags, min_block_size, behavior).await
    }

    async fn spawn(size: u64, flags: u16, min_block_size: u32, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Shared {
            size,
            flags,
            min_block_size,
            behavior,
            data: Arc::new(Mutex::new(vec![0u8; size as usize])),
            requests: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        };

        let server = TestServer {
            addr,
            data: shared.data.clone(),
            requests: shared.requests.clone(),
            disconnects: shared.disconnects.clone(),
            task: tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, shared).await;
                    });
                }
            }),
        };
        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn contents(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Table with one device, connected and ready against `server`
pub async fn connected_table(server: &TestServer) -> DeviceTable {
    connected_table_with(server, ClientConfig::new().devices(1).block_size(4096)).await
}

pub async fn connected_table_with(server: &TestServer, config: ClientConfig) -> DeviceTable {
    let table = DeviceTable::new(config).unwrap();
    table.connect(0, server.addr()).unwrap();
    table.wait_ready(0).await.unwrap();
    table
}

/// Deterministic test pattern
pub fn pattern(len: usize, seed: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(len);
    for i in 0..len {
        buf.put_u8((i as u8).wrapping_mul(31).wrapping_add(seed));
    }
    buf
}

async fn serve(mut stream: TcpStream, shared: Shared) -> std::io::Result<()> {
    if shared.behavior == Behavior::Silent {
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
        return Ok(());
    }

    let mut greeting = BytesMut::with_capacity(18);
    greeting.put_u64(NBD_INIT_MAGIC);
    greeting.put_u64(NBD_OPTS_MAGIC);
    greeting.put_u16(GlobalFlags::FIXED_NEWSTYLE | GlobalFlags::NO_ZEROES);
    stream.write_all(&greeting).await?;

    let client = ClientFlags::new(stream.read_u32().await?);

    loop {
        assert_eq!(stream.read_u64().await?, NBD_OPTS_MAGIC);
        let option = stream.read_u32().await?;
        let len = stream.read_u32().await?;
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data).await?;

        match NbdOption::try_from(option) {
            Ok(NbdOption::Go) if shared.behavior == Behavior::NoGo => {
                option_reply(&mut stream, option, NbdReplyType::ErrUnsup, &[]).await?;
            }
            Ok(NbdOption::Go) => {
                let mut info = BytesMut::new();
                info.put_u16(NBD_INFO_EXPORT);
                info.put_u64(shared.size);
                info.put_u16(shared.flags);
                option_reply(&mut stream, option, NbdReplyType::Info, &info).await?;

                let mut sizes = BytesMut::new();
                sizes.put_u16(NBD_INFO_BLOCK_SIZE);
                sizes.put_u32(shared.min_block_size);
                sizes.put_u32(4096);
                sizes.put_u32(1024 * 1024);
                option_reply(&mut stream, option, NbdReplyType::Info, &sizes).await?;

                option_reply(&mut stream, option, NbdReplyType::Ack, &[]).await?;
                break;
            }
            Ok(NbdOption::ExportName) => {
                let mut buf = BytesMut::new();
                buf.put_u64(shared.size);
                buf.put_u16(shared.flags);
                if client.bits() & ClientFlags::NO_ZEROES == 0 {
                    buf.put_bytes(0, 124);
                }
                stream.write_all(&buf).await?;
                break;
            }
            Ok(NbdOption::Abort) => return Ok(()),
            _ => {
                option_reply(&mut stream, option, NbdReplyType::ErrUnsup, &[]).await?;
            }
        }
    }

    transmission(stream, shared).await
}

async fn option_reply(
    stream: &mut TcpStream,
    option: u32,
    reply: NbdReplyType,
    data: &[u8],
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(20 + data.len());
    buf.put_u64(NBD_REP_MAGIC);
    buf.put_u32(option);
    buf.put_u32(reply as u32);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    stream.write_all(&buf).await
}

async fn transmission(mut stream: TcpStream, shared: Shared) -> std::io::Result<()> {
    let mut header = [0u8; NbdRequest::SIZE];
    let mut received = 0usize;

    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let request = NbdRequest::parse(&header).unwrap();

        let mut payload = vec![0u8; 0];
        if request.command == NbdCommand::Write {
            payload.resize(request.length as usize, 0);
            stream.read_exact(&mut payload).await?;
        }
        if request.command == NbdCommand::Disc {
            shared.disconnects.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        received += 1;
        shared.requests.fetch_add(1, Ordering::SeqCst);

        match shared.behavior {
            Behavior::Sever { after, reply_first } => {
                if received <= reply_first {
                    respond(&mut stream, &request, &payload, &shared).await?;
                }
                if received >= after {
                    stream.flush().await?;
                    return Ok(());
                }
            }
            Behavior::NoReplies => {}
            Behavior::WrongHandle => {
                let mut buf = BytesMut::with_capacity(NbdReply::SIZE);
                NbdReply::ok(request.handle ^ 0xdead_beef).encode(&mut buf);
                stream.write_all(&buf).await?;
            }
            Behavior::FailReadsAt(offset)
                if request.command == NbdCommand::Read && request.offset == offset =>
            {
                let mut buf = BytesMut::with_capacity(NbdReply::SIZE);
                NbdReply::new(request.handle, NbdError::Io).encode(&mut buf);
                stream.write_all(&buf).await?;
            }
            _ => respond(&mut stream, &request, &payload, &shared).await?,
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    request: &NbdRequest,
    payload: &[u8],
    shared: &Shared,
) -> std::io::Result<()> {
    let start = request.offset as usize;
    let end = start + request.length as usize;
    let mut buf = BytesMut::with_capacity(NbdReply::SIZE);

    match request.command {
        NbdCommand::Read => {
            NbdReply::ok(request.handle).encode(&mut buf);
            buf.put_slice(&shared.data.lock()[start..end]);
        }
        NbdCommand::Write => {
            shared.data.lock()[start..end].copy_from_slice(payload);
            NbdReply::ok(request.handle).encode(&mut buf);
        }
        NbdCommand::Trim => {
            shared.data.lock()[start..end].fill(0);
            NbdReply::ok(request.handle).encode(&mut buf);
        }
        NbdCommand::Flush => NbdReply::ok(request.handle).encode(&mut buf),
        NbdCommand::Disc => return Ok(()),
    }

    stream.write_all(&buf).await
}
