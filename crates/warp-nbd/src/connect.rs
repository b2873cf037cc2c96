//! Connection manager
//!
//! Connects are split in two: a synchronous start that allocates the
//! transport and installs a new connection generation, and an
//! asynchronous completion that runs on a spawned task. Every completion
//! carries a [`ConnectToken`] and is applied only if the device still holds
//! the generation the token names; anything else is a stale completion and
//! is discarded.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::device::{Device, DeviceTable, LinkPhase, Minor, next_generation};
use crate::error::{BlockError, BlockResult};
use crate::nbd::session::Session;
use crate::nbd::{ExportInfo, negotiate};

/// Byte stream an NBD session can run over
pub trait NbdStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> NbdStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport
pub type BoxedStream = Box<dyn NbdStream>;

/// Pending transport connect
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Opens transports to remote endpoints
pub trait Connector: Send + Sync {
    /// Allocate a transport and begin connecting to `addr`.
    ///
    /// Errors returned here are synchronous start failures. Failures of the
    /// connect itself are reported by the returned future.
    fn start_connect(&self, addr: SocketAddr) -> io::Result<ConnectFuture>;
}

/// TCP transport
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector from client configuration
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            nodelay: config.nodelay,
        }
    }
}

impl Connector for TcpConnector {
    fn start_connect(&self, addr: SocketAddr) -> io::Result<ConnectFuture> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let nodelay = self.nodelay;

        Ok(Box::pin(async move {
            let stream = socket.connect(addr).await?;
            stream.set_nodelay(nodelay)?;
            Ok(Box::new(stream) as BoxedStream)
        }))
    }
}

/// Identifies the connection generation a pending connect belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectToken {
    minor: Minor,
    generation: u64,
}

impl ConnectToken {
    /// Device the connect was issued for
    pub fn minor(&self) -> Minor {
        self.minor
    }

    /// Connection generation
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One connection generation, owned by the device slot
pub(crate) struct Connection {
    generation: u64,
    remote: SocketAddr,
    connected: AtomicBool,
    task: Mutex<ConnectTask>,
}

struct ConnectTask {
    closed: bool,
    handle: Option<AbortHandle>,
}

impl Connection {
    fn new(generation: u64, remote: SocketAddr) -> Self {
        Self {
            generation,
            remote,
            connected: AtomicBool::new(false),
            task: Mutex::new(ConnectTask {
                closed: false,
                handle: None,
            }),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_task(&self, handle: AbortHandle) {
        let mut task = self.task.lock();
        if task.closed {
            handle.abort();
        } else {
            task.handle = Some(handle);
        }
    }

    /// Mark the transport down and cancel a connect still in progress
    pub(crate) fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        let handle = {
            let mut task = self.task.lock();
            task.closed = true;
            task.handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl DeviceTable {
    /// Start connecting device `minor` to `remote`.
    ///
    /// Returns as soon as the transport has been allocated; the token
    /// identifies the new connection generation. Use [`wait_ready`] to
    /// await the outcome.
    ///
    /// [`wait_ready`]: DeviceTable::wait_ready
    pub fn connect(&self, minor: Minor, remote: SocketAddr) -> BlockResult<ConnectToken> {
        let device = self.lookup(minor)?;
        let runtime = Handle::try_current().map_err(io::Error::other)?;

        let (connection, pending) = {
            let mut state = device.lock();
            if let Some(existing) = &state.connection {
                return Err(BlockError::Busy(format!(
                    "device {} already connected to {}",
                    minor,
                    existing.remote()
                )));
            }

            let pending = self.connector.start_connect(remote)?;
            let connection = Arc::new(Connection::new(next_generation(), remote));
            state.connection = Some(connection.clone());
            state.connect_completed = false;
            device.set_phase(LinkPhase::Connecting);
            (connection, pending)
        };

        let token = ConnectToken {
            minor,
            generation: connection.generation(),
        };
        info!(
            "Device {} connecting to {} (generation {})",
            minor, remote, token.generation
        );

        let task = runtime.spawn(run_connect(
            device.clone(),
            token,
            pending,
            self.config.clone(),
        ));
        connection.set_task(task.abort_handle());

        Ok(token)
    }

    /// Point-in-time transport status
    pub fn connectivity_check(&self, minor: Minor) -> BlockResult<bool> {
        let device = self.lookup(minor)?;
        let state = device.lock();
        let connection = state
            .connection
            .as_ref()
            .ok_or(BlockError::NotConnected { minor })?;
        Ok(connection.is_connected())
    }

    /// Tear down the device's connection.
    ///
    /// In-flight requests complete with `ConnectionClosed`.
    pub fn disconnect(&self, minor: Minor) -> BlockResult<()> {
        let device = self.lookup(minor)?;
        let (connection, session) = {
            let mut state = device.lock();
            let detached = state.detach().ok_or(BlockError::NotConnected { minor })?;
            device.set_phase(LinkPhase::Disconnected);
            detached
        };

        device.counters.record_disconnect();
        connection.shutdown();
        if let Some(session) = session {
            session.close(true);
        }

        info!(
            "Device {} disconnected from {} (generation {})",
            minor,
            connection.remote(),
            connection.generation()
        );
        Ok(())
    }

    /// Wait until a pending connect on `minor` is ready or has failed
    pub async fn wait_ready(&self, minor: Minor) -> BlockResult<Arc<ExportInfo>> {
        let device = self.lookup(minor)?.clone();
        let mut phase = device.subscribe();
        let reached = *phase
            .wait_for(|p| *p != LinkPhase::Connecting)
            .await
            .map_err(|_| BlockError::ConnectionClosed)?;

        match reached {
            LinkPhase::Ready => device.export().ok_or(BlockError::NotReady { minor }),
            _ => Err(BlockError::NotReady { minor }),
        }
    }

    /// Like [`wait_ready`](DeviceTable::wait_ready), bounded by `timeout`
    pub async fn wait_ready_timeout(
        &self,
        minor: Minor,
        timeout: Duration,
    ) -> BlockResult<Arc<ExportInfo>> {
        tokio::time::timeout(timeout, self.wait_ready(minor))
            .await
            .map_err(|_| BlockError::Timeout(format!("device {} connect", minor)))?
    }
}

impl Device {
    /// Apply a transport connect completion.
    ///
    /// Returns false, changing nothing, when `token` no longer names the
    /// device's current connection.
    pub(crate) fn mark_connected(&self, token: ConnectToken) -> bool {
        let mut state = self.lock();
        let current = token.minor == self.minor()
            && state.generation() == Some(token.generation);
        if !current {
            drop(state);
            warn!(
                "Discarding stale connect completion for device {} (generation {})",
                token.minor, token.generation
            );
            return false;
        }

        state.connect_completed = true;
        if let Some(connection) = &state.connection {
            connection.connected.store(true, Ordering::Release);
        }
        debug!(
            "Device {} transport connected (generation {})",
            token.minor, token.generation
        );
        true
    }

    /// Install the negotiated export and start transmission
    fn apply_handshake(
        self: &Arc<Self>,
        token: ConnectToken,
        export: ExportInfo,
        stream: BoxedStream,
        config: &ClientConfig,
    ) -> bool {
        let mut state = self.lock();
        let current = state.generation() == Some(token.generation) && state.connect_completed;
        if !current {
            drop(state);
            warn!(
                "Discarding stale handshake for device {} (generation {})",
                token.minor, token.generation
            );
            return false;
        }

        let usable = export.usable_block_size(state.client_block_size);
        if usable != state.client_block_size {
            warn!(
                "Device {} block size {} is not a multiple of the export minimum {}; using {}",
                token.minor, state.client_block_size, export.min_block_size, usable
            );
            state.client_block_size = usable;
        }

        let export = Arc::new(export);
        let session = Session::start(self.clone(), token.generation, stream, config);
        state.size = Some(export.size);
        state.export = Some(export.clone());
        state.session = Some(session);
        self.set_phase(LinkPhase::Ready);
        drop(state);

        self.counters.record_connect();
        info!(
            "Device {} ready: export {:?} size={} flags={:04x} max_block={}",
            token.minor,
            export.name,
            export.size,
            export.flags.bits(),
            export.max_block_size
        );
        true
    }

    /// Tear down `generation` if it is still current. Returns whether it was.
    pub(crate) fn drop_generation(&self, generation: u64, reason: &BlockError) -> bool {
        let detached = {
            let mut state = self.lock();
            if state.generation() != Some(generation) {
                return false;
            }
            let detached = state.detach();
            self.set_phase(LinkPhase::Disconnected);
            detached
        };

        let Some((connection, session)) = detached else {
            return false;
        };

        warn!(
            "Device {} lost connection to {} (generation {}): {}",
            self.minor(),
            connection.remote(),
            generation,
            reason
        );
        self.counters.record_disconnect();
        connection.shutdown();
        if let Some(session) = session {
            session.close(false);
        }
        true
    }
}

async fn run_connect(
    device: Arc<Device>,
    token: ConnectToken,
    pending: ConnectFuture,
    config: Arc<ClientConfig>,
) {
    let connected = tokio::time::timeout(config.connect_timeout_duration(), pending).await;
    let mut stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            device.drop_generation(token.generation, &BlockError::Io(e));
            return;
        }
        Err(_) => {
            let err = BlockError::Timeout("transport connect".to_string());
            device.drop_generation(token.generation, &err);
            return;
        }
    };

    if !device.mark_connected(token) {
        return;
    }

    let negotiated = tokio::time::timeout(
        config.handshake_timeout_duration(),
        negotiate(&mut stream, &config.export_name),
    )
    .await;

    match negotiated {
        Ok(Ok(export)) => {
            device.apply_handshake(token, export, stream, &config);
        }
        Ok(Err(e)) => {
            device.drop_generation(token.generation, &e);
        }
        Err(_) => {
            let err = BlockError::Timeout("handshake".to_string());
            device.drop_generation(token.generation, &err);
        }
    }
}
