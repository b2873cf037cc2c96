//! In-memory transports for unit tests

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::oneshot;

use crate::connect::{BoxedStream, ConnectFuture, Connector};
use crate::nbd::{EXPORT_NAME_PADDING, NBD_CLISERV_MAGIC, NBD_INIT_MAGIC, TransmissionFlags};

/// Connector whose peers greet old-style and then sit idle
pub(crate) struct MemoryConnector {
    size: u64,
    flags: u16,
    gated: bool,
    refuse_start: AtomicBool,
    refuse_connect: AtomicBool,
    gates: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    peers: Arc<Mutex<Vec<DuplexStream>>>,
}

impl MemoryConnector {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            size,
            flags: TransmissionFlags::HAS_FLAGS | TransmissionFlags::SEND_FLUSH,
            gated: false,
            refuse_start: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            gates: Mutex::new(Vec::new()),
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Hold every connect until [`release`](Self::release) is called
    pub(crate) fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub(crate) fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Let the `index`th connect attempt proceed
    pub(crate) fn release(&self, index: usize) {
        let gate = self.gates.lock().get_mut(index).and_then(Option::take);
        if let Some(gate) = gate {
            let _ = gate.send(());
        }
    }

    pub(crate) fn refuse_start(&self, refuse: bool) {
        self.refuse_start.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Drop the server side of every transport
    pub(crate) fn sever_all(&self) {
        self.peers.lock().clear();
    }

    fn greeting(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64(NBD_INIT_MAGIC);
        buf.put_u64(NBD_CLISERV_MAGIC);
        buf.put_u64(self.size);
        buf.put_u32(self.flags as u32);
        buf.put_bytes(0, EXPORT_NAME_PADDING);
        buf
    }
}

impl Connector for MemoryConnector {
    fn start_connect(&self, _addr: SocketAddr) -> io::Result<ConnectFuture> {
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no sockets left",
            ));
        }

        let refuse = self.refuse_connect.load(Ordering::SeqCst);
        let gate = if self.gated {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().push(Some(tx));
            Some(rx)
        } else {
            None
        };
        let greeting = self.greeting();
        let peers = self.peers.clone();

        Ok(Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if refuse {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }

            let (client, mut server) = duplex(64 * 1024);
            server.write_all(&greeting).await?;
            peers.lock().push(server);
            Ok(Box::new(client) as BoxedStream)
        }))
    }
}
