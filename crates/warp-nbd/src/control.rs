//! Control surface
//!
//! Configuration commands issued by the OS-adaptation layer as an opaque
//! code plus a fixed-layout big-endian payload. Unknown codes are rejected
//! with `Unsupported`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::connect::ConnectToken;
use crate::device::{Device, DeviceTable, Minor};
use crate::error::{BlockError, BlockResult};

/// Control command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    /// Report the client block size
    GetBlockSize = 1,
    /// Change the client block size
    SetBlockSize = 2,
    /// Report `size / block size`
    GetBlockCount = 3,
    /// Start connecting to a remote endpoint
    Connect = 4,
    /// Report transport status
    ConnectivityCheck = 5,
    /// Tear the connection down
    Disconnect = 6,
}

impl TryFrom<u32> for ControlCode {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::GetBlockSize),
            2 => Ok(Self::SetBlockSize),
            3 => Ok(Self::GetBlockCount),
            4 => Ok(Self::Connect),
            5 => Ok(Self::ConnectivityCheck),
            6 => Ok(Self::Disconnect),
            _ => Err(BlockError::Unsupported(format!(
                "control command {:#x}",
                value
            ))),
        }
    }
}

/// Address family tags in the connect payload
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Decoded control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Report the client block size
    GetBlockSize,
    /// Change the client block size
    SetBlockSize(u32),
    /// Report the block count
    GetBlockCount,
    /// Connect to a remote endpoint
    Connect(SocketAddr),
    /// Report transport status
    ConnectivityCheck,
    /// Tear the connection down
    Disconnect,
}

impl ControlCommand {
    /// Command code
    pub fn code(&self) -> ControlCode {
        match self {
            Self::GetBlockSize => ControlCode::GetBlockSize,
            Self::SetBlockSize(_) => ControlCode::SetBlockSize,
            Self::GetBlockCount => ControlCode::GetBlockCount,
            Self::Connect(_) => ControlCode::Connect,
            Self::ConnectivityCheck => ControlCode::ConnectivityCheck,
            Self::Disconnect => ControlCode::Disconnect,
        }
    }

    /// Decode a command from its code and payload
    pub fn decode(code: u32, payload: &[u8]) -> BlockResult<Self> {
        let mut buf = payload;
        match ControlCode::try_from(code)? {
            ControlCode::GetBlockSize => Ok(Self::GetBlockSize),
            ControlCode::SetBlockSize => {
                if buf.remaining() < 4 {
                    return Err(short_payload(code, 4, payload.len()));
                }
                Ok(Self::SetBlockSize(buf.get_u32()))
            }
            ControlCode::GetBlockCount => Ok(Self::GetBlockCount),
            ControlCode::Connect => {
                if buf.remaining() < 3 {
                    return Err(short_payload(code, 3, payload.len()));
                }
                let family = buf.get_u8();
                let port = buf.get_u16();
                let ip = match family {
                    FAMILY_V4 if buf.remaining() >= 4 => {
                        IpAddr::V4(Ipv4Addr::from(buf.get_u32()))
                    }
                    FAMILY_V6 if buf.remaining() >= 16 => {
                        IpAddr::V6(Ipv6Addr::from(buf.get_u128()))
                    }
                    FAMILY_V4 => return Err(short_payload(code, 7, payload.len())),
                    FAMILY_V6 => return Err(short_payload(code, 19, payload.len())),
                    other => {
                        return Err(BlockError::InvalidArgument(format!(
                            "unknown address family {}",
                            other
                        )));
                    }
                };
                Ok(Self::Connect(SocketAddr::new(ip, port)))
            }
            ControlCode::ConnectivityCheck => Ok(Self::ConnectivityCheck),
            ControlCode::Disconnect => Ok(Self::Disconnect),
        }
    }

    /// Encode the payload
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::SetBlockSize(size) => buf.put_u32(*size),
            Self::Connect(addr) => match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.put_u8(FAMILY_V4);
                    buf.put_u16(addr.port());
                    buf.put_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.put_u8(FAMILY_V6);
                    buf.put_u16(addr.port());
                    buf.put_slice(&ip.octets());
                }
            },
            _ => {}
        }
    }
}

fn short_payload(code: u32, expected: usize, got: usize) -> BlockError {
    BlockError::InvalidArgument(format!(
        "control command {} needs {} payload bytes, got {}",
        code, expected, got
    ))
}

/// Result of a control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// Client block size
    BlockSize(u32),
    /// Number of client blocks
    BlockCount(u64),
    /// Connect started
    Connecting(ConnectToken),
    /// Transport status
    Connected(bool),
    /// Command applied
    Done,
}

impl ControlReply {
    /// Encode the reply payload
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::BlockSize(size) => buf.put_u32(*size),
            Self::BlockCount(count) => buf.put_u64(*count),
            Self::Connected(connected) => buf.put_u32(*connected as u32),
            Self::Connecting(_) | Self::Done => {}
        }
    }
}

impl Device {
    /// Client block size
    pub fn block_size(&self) -> u32 {
        self.lock().client_block_size
    }

    /// Set the client block size.
    ///
    /// Must be non-zero and a multiple of the export's minimum block size.
    pub fn set_block_size(&self, size: u32) -> BlockResult<()> {
        if size == 0 {
            return Err(BlockError::InvalidArgument(
                "block size must be non-zero".to_string(),
            ));
        }

        let mut state = self.lock();
        let min = state
            .export
            .as_ref()
            .map_or(1, |e| e.min_block_size)
            .max(1);
        if size % min != 0 {
            return Err(BlockError::InvalidArgument(format!(
                "block size {} is not a multiple of the export minimum {}",
                size, min
            )));
        }
        state.client_block_size = size;
        Ok(())
    }

    /// Export size in client blocks
    pub fn block_count(&self) -> BlockResult<u64> {
        let state = self.lock();
        let size = match state.size {
            Some(size) if state.connect_completed && state.connection.is_some() => size,
            _ => {
                return Err(BlockError::NotReady {
                    minor: self.minor(),
                });
            }
        };
        Ok(size / state.client_block_size as u64)
    }
}

impl DeviceTable {
    /// Execute a control command against device `minor`
    pub fn control(&self, minor: Minor, command: ControlCommand) -> BlockResult<ControlReply> {
        let device = self.lookup(minor)?;
        debug!("Device {} control {:?}", minor, command);

        match command {
            ControlCommand::GetBlockSize => Ok(ControlReply::BlockSize(device.block_size())),
            ControlCommand::SetBlockSize(size) => {
                device.set_block_size(size)?;
                Ok(ControlReply::Done)
            }
            ControlCommand::GetBlockCount => Ok(ControlReply::BlockCount(device.block_count()?)),
            ControlCommand::Connect(remote) => {
                Ok(ControlReply::Connecting(self.connect(minor, remote)?))
            }
            ControlCommand::ConnectivityCheck => {
                Ok(ControlReply::Connected(self.connectivity_check(minor)?))
            }
            ControlCommand::Disconnect => {
                self.disconnect(minor)?;
                Ok(ControlReply::Done)
            }
        }
    }

    /// Decode, execute and encode a raw control command
    pub fn control_raw(&self, minor: Minor, code: u32, payload: &[u8]) -> BlockResult<Bytes> {
        let command = ControlCommand::decode(code, payload)?;
        let reply = self.control(minor, command)?;
        let mut buf = BytesMut::with_capacity(8);
        reply.encode(&mut buf);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::testing::MemoryConnector;
    use std::sync::Arc;

    async fn ready_table(size: u64) -> DeviceTable {
        let table = DeviceTable::with_connector(
            ClientConfig::new().devices(1).block_size(4096),
            Arc::new(MemoryConnector::new(size)),
        )
        .unwrap();
        table
            .control(0, ControlCommand::Connect("10.0.0.1:10809".parse().unwrap()))
            .unwrap();
        table.wait_ready(0).await.unwrap();
        table
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(
            ControlCommand::decode(1, &[]).unwrap(),
            ControlCommand::GetBlockSize
        );
        assert_eq!(
            ControlCommand::decode(2, &512u32.to_be_bytes()).unwrap(),
            ControlCommand::SetBlockSize(512)
        );
        assert_eq!(
            ControlCommand::decode(5, &[]).unwrap(),
            ControlCommand::ConnectivityCheck
        );

        let payload = [4, 0x2a, 0x29, 127, 0, 0, 1];
        assert_eq!(
            ControlCommand::decode(4, &payload).unwrap(),
            ControlCommand::Connect("127.0.0.1:10793".parse().unwrap())
        );
    }

    #[test]
    fn test_connect_payload_encoding() {
        for addr in ["192.168.1.20:10809", "[2001:db8::5]:10809"] {
            let command = ControlCommand::Connect(addr.parse().unwrap());
            let mut buf = BytesMut::new();
            command.encode_payload(&mut buf);
            let decoded = ControlCommand::decode(command.code() as u32, &buf).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            ControlCommand::decode(0x4c01, &[]),
            Err(BlockError::Unsupported(_))
        ));
        assert!(matches!(
            ControlCommand::decode(2, &[0, 1]),
            Err(BlockError::InvalidArgument(_))
        ));
        assert!(matches!(
            ControlCommand::decode(4, &[6, 0, 80, 0, 0]),
            Err(BlockError::InvalidArgument(_))
        ));
        assert!(matches!(
            ControlCommand::decode(4, &[5, 0, 80, 1, 2, 3, 4]),
            Err(BlockError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_block_size_commands() {
        let table = DeviceTable::new(ClientConfig::new().devices(1)).unwrap();

        assert_eq!(
            table.control(0, ControlCommand::GetBlockSize).unwrap(),
            ControlReply::BlockSize(4096)
        );
        table.control(0, ControlCommand::SetBlockSize(4097)).unwrap();
        assert_eq!(
            table.control_raw(0, 1, &[]).unwrap().as_ref(),
            &4097u32.to_be_bytes()
        );
        assert!(matches!(
            table.control(0, ControlCommand::SetBlockSize(0)),
            Err(BlockError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_block_count_needs_handshake() {
        let table = DeviceTable::new(ClientConfig::new().devices(1)).unwrap();
        assert!(matches!(
            table.control(0, ControlCommand::GetBlockCount),
            Err(BlockError::NotReady { minor: 0 })
        ));
        assert!(matches!(
            table.control(0, ControlCommand::ConnectivityCheck),
            Err(BlockError::NotConnected { minor: 0 })
        ));
    }

    #[tokio::test]
    async fn test_block_count_is_exact_division() {
        let table = ready_table(1048576).await;

        assert_eq!(
            table.control(0, ControlCommand::GetBlockCount).unwrap(),
            ControlReply::BlockCount(256)
        );

        table.control(0, ControlCommand::SetBlockSize(4097)).unwrap();
        assert_eq!(
            table.control(0, ControlCommand::GetBlockCount).unwrap(),
            ControlReply::BlockCount(255)
        );

        table.control(0, ControlCommand::SetBlockSize(3000)).unwrap();
        assert_eq!(
            table.control_raw(0, 3, &[]).unwrap().as_ref(),
            &349u64.to_be_bytes()
        );
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_commands() {
        let table = ready_table(8192).await;

        assert_eq!(
            table.control(0, ControlCommand::ConnectivityCheck).unwrap(),
            ControlReply::Connected(true)
        );
        assert!(matches!(
            table.control(0, ControlCommand::Connect("10.0.0.2:10809".parse().unwrap())),
            Err(BlockError::Busy(_))
        ));

        assert_eq!(
            table.control(0, ControlCommand::Disconnect).unwrap(),
            ControlReply::Done
        );
        assert!(matches!(
            table.control(0, ControlCommand::GetBlockCount),
            Err(BlockError::NotReady { minor: 0 })
        ));
    }
}
