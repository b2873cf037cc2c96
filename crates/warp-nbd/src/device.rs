//! Device table
//!
//! A fixed arena of device slots indexed by minor number. Each slot carries
//! its own lock; there is no lock over the whole table. The lock guards
//! short check-and-set steps only and is never held across an await.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::connect::{Connection, Connector, TcpConnector};
use crate::error::{BlockError, BlockResult};
use crate::nbd::ExportInfo;
use crate::nbd::session::Session;
use crate::stats::{DeviceStats, StatsCounters};

/// Device minor number
pub type Minor = u32;

/// Identity of the process holding a device open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Create from raw value
    pub fn from_raw(val: u64) -> Self {
        Self(val)
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Transport phase of a device, observable through [`Device::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No connection object
    Disconnected,
    /// Connect or handshake in progress
    Connecting,
    /// Handshake complete, I/O accepted
    Ready,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Source of connection generation numbers, unique for the process
static GENERATION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Mutable per-device state, guarded by the device lock
pub(crate) struct DeviceState {
    pub(crate) opened_by: Option<OwnerId>,
    pub(crate) client_block_size: u32,
    pub(crate) size: Option<u64>,
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) connect_completed: bool,
    pub(crate) export: Option<Arc<ExportInfo>>,
    pub(crate) session: Option<Arc<Session>>,
}

impl DeviceState {
    fn new(block_size: u32) -> Self {
        Self {
            opened_by: None,
            client_block_size: block_size,
            size: None,
            connection: None,
            connect_completed: false,
            export: None,
            session: None,
        }
    }

    /// Generation of the installed connection, if any
    pub(crate) fn generation(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.generation())
    }

    /// Drop everything tied to the current connection generation
    pub(crate) fn detach(&mut self) -> Option<(Arc<Connection>, Option<Arc<Session>>)> {
        let connection = self.connection.take()?;
        let session = self.session.take();
        self.connect_completed = false;
        self.size = None;
        self.export = None;
        Some((connection, session))
    }
}

/// One logical block device slot
pub struct Device {
    minor: Minor,
    default_block_size: u32,
    state: Mutex<DeviceState>,
    phase: watch::Sender<LinkPhase>,
    pub(crate) counters: Arc<StatsCounters>,
}

impl Device {
    fn new(minor: Minor, default_block_size: u32) -> Self {
        let (phase, _) = watch::channel(LinkPhase::Disconnected);
        Self {
            minor,
            default_block_size,
            state: Mutex::new(DeviceState::new(default_block_size)),
            phase,
            counters: Arc::new(StatsCounters::default()),
        }
    }

    /// Minor number of this slot
    pub fn minor(&self) -> Minor {
        self.minor
    }

    /// Block size restored on close
    pub fn default_block_size(&self) -> u32 {
        self.default_block_size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Current opener, if any
    pub fn opened_by(&self) -> Option<OwnerId> {
        self.lock().opened_by
    }

    /// Negotiated export size, once the handshake has completed
    pub fn size(&self) -> Option<u64> {
        self.lock().size
    }

    /// Whether the current connection's transport completion was applied
    pub fn is_connect_completed(&self) -> bool {
        self.lock().connect_completed
    }

    /// Whether a connection object exists
    pub fn has_connection(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// Export negotiated by the current connection
    pub fn export(&self) -> Option<Arc<ExportInfo>> {
        self.lock().export.clone()
    }

    /// Current transport phase
    pub fn phase(&self) -> LinkPhase {
        *self.phase.borrow()
    }

    /// Watch transport phase changes
    pub fn subscribe(&self) -> watch::Receiver<LinkPhase> {
        self.phase.subscribe()
    }

    /// Must be called with the device lock held
    pub(crate) fn set_phase(&self, phase: LinkPhase) {
        self.phase.send_replace(phase);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .field("opened_by", &state.opened_by)
            .field("client_block_size", &state.client_block_size)
            .field("size", &state.size)
            .field("generation", &state.generation())
            .field("connect_completed", &state.connect_completed)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Process-wide registry of device slots
pub struct DeviceTable {
    devices: Vec<Arc<Device>>,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) connector: Arc<dyn Connector>,
}

impl DeviceTable {
    /// Create a table of `config.devices` slots that connects over TCP
    pub fn new(config: ClientConfig) -> BlockResult<Self> {
        let connector = Arc::new(TcpConnector::new(&config));
        Self::with_connector(config, connector)
    }

    /// Create a table with a custom transport connector
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> BlockResult<Self> {
        config.validate()?;

        let devices = (0..config.devices)
            .map(|minor| Arc::new(Device::new(minor, config.default_block_size)))
            .collect();

        Ok(Self {
            devices,
            config: Arc::new(config),
            connector,
        })
    }

    /// Look up a device slot
    pub fn lookup(&self, minor: Minor) -> BlockResult<&Arc<Device>> {
        self.devices
            .get(minor as usize)
            .ok_or(BlockError::NotFound { minor })
    }

    /// Number of device slots
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the table has no slots
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate over all slots
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    /// Table configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTable")
            .field("devices", &self.devices.len())
            .field("config", &self.config)
            .finish()
    }
}
