#![allow(clippy::collapsible_if)]

//! NBD Block Device Client for WARP Storage
//!
//! This crate is the core of a network block device client: a fixed table
//! of logical block devices, each of which can be connected to a remote NBD
//! server and then driven with block reads and writes.
//!
//! # Features
//!
//! - Per-device exclusive open with close that preserves the connection
//! - Asynchronous connect with generation-checked completions
//! - Client-side NBD handshake (`NBD_OPT_GO`, `EXPORT_NAME`, old-style)
//! - Pipelined transmission with handle-matched replies
//! - Control commands with a fixed binary encoding
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        OS adaptation (device node)       │
//! └──────┬──────────────┬──────────────┬─────┘
//!        │ open/close   │ control      │ block I/O
//! ┌──────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//! │  Admission  │ │  Control   │ │  Dispatch  │
//! └──────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!        │        ┌─────▼──────┐       │
//!        │        │  Connect   │       │
//!        │        └─────┬──────┘       │
//! ┌──────▼──────────────▼──────────────▼─────┐
//! │   DeviceTable (per-slot lock, phases)    │
//! └─────────────────────┬────────────────────┘
//!                ┌──────▼──────┐
//!                │ NBD session │ writer task + reader task
//!                └──────┬──────┘
//!                       │ TCP
//!                ┌──────▼──────┐
//!                │ NBD server  │
//!                └─────────────┘
//! ```

#![warn(missing_docs)]

pub mod admission;
pub mod config;
pub mod connect;
pub mod control;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod nbd;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ClientConfig, DEFAULT_BLOCK_SIZE};
pub use connect::{BoxedStream, ConnectFuture, ConnectToken, Connector, NbdStream, TcpConnector};
pub use control::{ControlCode, ControlCommand, ControlReply};
pub use device::{Device, DeviceTable, LinkPhase, Minor, OwnerId};
pub use dispatch::{BlockIo, Direction, IoCompletion, PendingIo};
pub use error::{BlockError, BlockResult, NbdError};
pub use nbd::{ExportInfo, TransmissionFlags};
pub use stats::DeviceStats;
