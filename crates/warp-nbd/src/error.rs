//! Block device error types
//!
//! Error types for the NBD client core, plus the mapping onto the OS error
//! codes that the device-node shim hands back to whoever issued the call.

use std::io;

use thiserror::Error;

/// Block device result type
pub type BlockResult<T> = Result<T, BlockError>;

/// Block device error types
#[derive(Debug, Error)]
pub enum BlockError {
    /// Resource already owned or connected
    #[error("Device busy: {0}")]
    Busy(String),

    /// Caller/device mismatch or malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Minor number outside the configured table
    #[error("No such device: minor {minor}")]
    NotFound {
        /// Requested minor
        minor: u32,
    },

    /// Device has no connected transport or the handshake is incomplete
    #[error("Device {minor} is not ready")]
    NotReady {
        /// Device minor
        minor: u32,
    },

    /// No connection object exists for a status query
    #[error("Device {minor} has no connection")]
    NotConnected {
        /// Device minor
        minor: u32,
    },

    /// Transport failed or was torn down while the request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unknown control command or command the export does not support
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Server reported an error for a single request
    #[error("I/O failure reported by server: {0}")]
    IoFailure(NbdError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid offset
    #[error("Invalid offset: {offset} (export size: {size})")]
    InvalidOffset {
        /// Requested byte offset
        offset: u64,
        /// Export size
        size: u64,
    },

    /// Invalid length
    #[error("Invalid length: {length}")]
    InvalidLength {
        /// Requested byte count
        length: u64,
    },

    /// Export is read-only
    #[error("Export is read-only")]
    ReadOnly,

    /// Connect, handshake or socket write took too long
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// errno values surfaced to the OS layer
mod errno {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOTTY: i32 = 25;
    pub const ENOSPC: i32 = 28;
    pub const EROFS: i32 = 30;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const ENOTSUP: i32 = 95;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
}

impl BlockError {
    /// Standard OS error code for this error
    pub fn errno(&self) -> i32 {
        match self {
            BlockError::Busy(_) => errno::EBUSY,
            BlockError::InvalidArgument(_)
            | BlockError::InvalidOffset { .. }
            | BlockError::InvalidLength { .. }
            | BlockError::Config(_) => errno::EINVAL,
            BlockError::NotFound { .. } => errno::ENODEV,
            BlockError::NotReady { .. } => errno::ENXIO,
            BlockError::NotConnected { .. } => errno::ENOTCONN,
            BlockError::ConnectionClosed => errno::ECONNRESET,
            BlockError::Protocol(_) => errno::EPROTO,
            BlockError::Unsupported(_) => errno::ENOTTY,
            BlockError::IoFailure(e) => e.to_errno(),
            BlockError::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
            BlockError::ReadOnly => errno::EROFS,
            BlockError::Timeout(_) => errno::ETIMEDOUT,
        }
    }

    /// Whether this error forces the device's connection down
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, BlockError::ConnectionClosed | BlockError::Protocol(_))
    }
}

/// NBD error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdError {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// I/O error
    Io = 5,
    /// Out of memory
    NoMem = 12,
    /// Invalid argument
    Inval = 22,
    /// No space left on device
    NoSpc = 28,
    /// Value too large
    Overflow = 75,
    /// Function not implemented
    NotSup = 95,
    /// Device not found
    NoSuchDevice = 19,
    /// Read-only filesystem
    Rofs = 30,
    /// Shutdown in progress
    Shutdown = 108,
}

impl NbdError {
    /// Get the error code
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Check if this is a success
    pub fn is_ok(&self) -> bool {
        matches!(self, NbdError::Ok)
    }

    /// Decode a reply error field; unknown values collapse to `Io`
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => Self::Ok,
            1 => Self::Perm,
            5 => Self::Io,
            12 => Self::NoMem,
            22 => Self::Inval,
            28 => Self::NoSpc,
            75 => Self::Overflow,
            95 => Self::NotSup,
            19 => Self::NoSuchDevice,
            30 => Self::Rofs,
            108 => Self::Shutdown,
            _ => Self::Io,
        }
    }

    /// Host errno for this wire code
    pub fn to_errno(&self) -> i32 {
        match self {
            NbdError::Ok => 0,
            NbdError::Perm => errno::EPERM,
            NbdError::Io => errno::EIO,
            NbdError::NoMem => errno::ENOMEM,
            NbdError::Inval => errno::EINVAL,
            NbdError::NoSpc => errno::ENOSPC,
            NbdError::Overflow => errno::EOVERFLOW,
            NbdError::NotSup => errno::ENOTSUP,
            NbdError::NoSuchDevice => errno::ENODEV,
            NbdError::Rofs => errno::EROFS,
            NbdError::Shutdown => errno::ESHUTDOWN,
        }
    }
}

impl std::fmt::Display for NbdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbdError::Ok => write!(f, "Success"),
            NbdError::Perm => write!(f, "Permission denied"),
            NbdError::Io => write!(f, "I/O error"),
            NbdError::NoMem => write!(f, "Out of memory"),
            NbdError::Inval => write!(f, "Invalid argument"),
            NbdError::NoSpc => write!(f, "No space left"),
            NbdError::Overflow => write!(f, "Value too large"),
            NbdError::NotSup => write!(f, "Not supported"),
            NbdError::NoSuchDevice => write!(f, "No such device"),
            NbdError::Rofs => write!(f, "Read-only"),
            NbdError::Shutdown => write!(f, "Shutdown"),
        }
    }
}
