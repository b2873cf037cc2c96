//! NBD (Network Block Device) protocol implementation
//!
//! Client side of the NBD protocol as specified in:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Only simple replies are used; structured replies are never negotiated.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{BlockError, BlockResult, NbdError};

pub mod handshake;
pub(crate) mod session;

pub use handshake::negotiate;

/// Server greeting ("NBDMAGIC")
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943;
/// Old-style handshake
pub const NBD_CLISERV_MAGIC: u64 = 0x00420281861253;
/// Newstyle option negotiation ("IHAVEOPT")
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
/// Option reply
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
/// Transmission request
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Simple reply
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;
/// Structured reply (never negotiated)
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// `NBD_INFO_EXPORT`: size and transmission flags
pub const NBD_INFO_EXPORT: u16 = 0;
/// `NBD_INFO_BLOCK_SIZE`: min/preferred/max block size
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Zero padding after an `NBD_OPT_EXPORT_NAME` reply unless NO_ZEROES
pub const EXPORT_NAME_PADDING: usize = 124;

/// NBD handshake flags sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalFlags(u16);

impl GlobalFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;
    /// No zeroes padding
    pub const NO_ZEROES: u16 = 1 << 1;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Server supports fixed newstyle
    pub fn fixed_newstyle(&self) -> bool {
        self.0 & Self::FIXED_NEWSTYLE != 0
    }

    /// Server can omit the export-name padding
    pub fn no_zeroes(&self) -> bool {
        self.0 & Self::NO_ZEROES != 0
    }
}

/// NBD client flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Fixed newstyle
    pub const FIXED_NEWSTYLE: u32 = 1 << 0;
    /// No zeroes
    pub const NO_ZEROES: u32 = 1 << 1;

    /// Create new flags
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Mirror whatever the server offered
    pub fn for_server(server: GlobalFlags) -> Self {
        let mut bits = 0;
        if server.fixed_newstyle() {
            bits |= Self::FIXED_NEWSTYLE;
        }
        if server.no_zeroes() {
            bits |= Self::NO_ZEROES;
        }
        Self(bits)
    }
}

/// NBD transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Has flags (always set)
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Read-only export
    pub const READ_ONLY: u16 = 1 << 1;
    /// Send FLUSH command
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Send TRIM command
    pub const SEND_TRIM: u16 = 1 << 5;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Export rejects writes
    pub fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    /// Export accepts FLUSH
    pub fn can_flush(&self) -> bool {
        self.0 & Self::SEND_FLUSH != 0
    }

    /// Export accepts TRIM
    pub fn can_trim(&self) -> bool {
        self.0 & Self::SEND_TRIM != 0
    }
}

/// NBD option codes used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    /// Export name
    ExportName = 1,
    /// Abort
    Abort = 2,
    /// Go (finish negotiation)
    Go = 7,
}

impl TryFrom<u32> for NbdOption {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ExportName),
            2 => Ok(Self::Abort),
            7 => Ok(Self::Go),
            _ => Err(BlockError::Protocol(format!("Unknown option: {}", value))),
        }
    }
}

/// NBD option reply types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdReplyType {
    /// Acknowledge
    Ack = 1,
    /// Server info
    Server = 2,
    /// Info (export info)
    Info = 3,
    /// Error: unsupported option
    ErrUnsup = (1 << 31) | 1,
    /// Error: policy
    ErrPolicy = (1 << 31) | 2,
    /// Error: invalid
    ErrInvalid = (1 << 31) | 3,
    /// Error: platform
    ErrPlatform = (1 << 31) | 4,
    /// Error: TLS required
    ErrTlsReqd = (1 << 31) | 5,
    /// Error: unknown export
    ErrUnknown = (1 << 31) | 6,
    /// Error: shutdown
    ErrShutdown = (1 << 31) | 7,
    /// Error: block size required
    ErrBlockSizeReqd = (1 << 31) | 8,
    /// Error: too big
    ErrTooBig = (1 << 31) | 9,
}

impl NbdReplyType {
    /// Error replies have the top bit set
    pub fn is_error_code(raw: u32) -> bool {
        raw & (1 << 31) != 0
    }
}

impl TryFrom<u32> for NbdReplyType {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        const ERR: u32 = 1 << 31;
        match value {
            1 => Ok(Self::Ack),
            2 => Ok(Self::Server),
            3 => Ok(Self::Info),
            v if v == ERR | 1 => Ok(Self::ErrUnsup),
            v if v == ERR | 2 => Ok(Self::ErrPolicy),
            v if v == ERR | 3 => Ok(Self::ErrInvalid),
            v if v == ERR | 4 => Ok(Self::ErrPlatform),
            v if v == ERR | 5 => Ok(Self::ErrTlsReqd),
            v if v == ERR | 6 => Ok(Self::ErrUnknown),
            v if v == ERR | 7 => Ok(Self::ErrShutdown),
            v if v == ERR | 8 => Ok(Self::ErrBlockSizeReqd),
            v if v == ERR | 9 => Ok(Self::ErrTooBig),
            _ => Err(BlockError::Protocol(format!(
                "Unknown option reply type: {:08x}",
                value
            ))),
        }
    }
}

/// NBD command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush
    Flush = 3,
    /// Trim
    Trim = 4,
}

impl TryFrom<u16> for NbdCommand {
    type Error = BlockError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Trim),
            _ => Err(BlockError::Protocol(format!("Unknown command: {}", value))),
        }
    }
}

/// NBD command flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// NBD request header
#[derive(Debug, Clone)]
pub struct NbdRequest {
    /// Command flags
    pub flags: CommandFlags,
    /// Command type
    pub command: NbdCommand,
    /// Handle (cookie for matching reply)
    pub handle: u64,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u32,
}

impl NbdRequest {
    /// Request size (always 28 bytes)
    pub const SIZE: usize = 28;

    /// Create a request with no flags
    pub fn new(command: NbdCommand, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            flags: CommandFlags::default(),
            command,
            handle,
            offset,
            length,
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.command as u16);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
    }

    /// Parse from bytes
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("Request too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(BlockError::Protocol(format!(
                "Invalid request magic: {:08x}",
                magic
            )));
        }

        let flags = CommandFlags::new(buf.get_u16());
        let cmd_type = buf.get_u16();
        let command = NbdCommand::try_from(cmd_type)?;
        let handle = buf.get_u64();
        let offset = buf.get_u64();
        let length = buf.get_u32();

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD simple reply
#[derive(Debug, Clone)]
pub struct NbdReply {
    /// Error code
    pub error: NbdError,
    /// Handle (matches request)
    pub handle: u64,
}

impl NbdReply {
    /// Reply size (always 16 bytes)
    pub const SIZE: usize = 16;

    /// Create a new reply
    pub fn new(handle: u64, error: NbdError) -> Self {
        Self { error, handle }
    }

    /// Create a success reply
    pub fn ok(handle: u64) -> Self {
        Self {
            error: NbdError::Ok,
            handle,
        }
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REPLY_MAGIC);
        buf.put_u32(self.error.code());
        buf.put_u64(self.handle);
    }

    /// Parse a reply header
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("Reply too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        match magic {
            NBD_REPLY_MAGIC => {}
            NBD_STRUCTURED_REPLY_MAGIC => {
                return Err(BlockError::Protocol(
                    "Structured reply received but never negotiated".to_string(),
                ));
            }
            _ => {
                return Err(BlockError::Protocol(format!(
                    "Invalid reply magic: {:08x}",
                    magic
                )));
            }
        }

        let error = NbdError::from_errno(buf.get_u32() as i32);
        let handle = buf.get_u64();
        Ok(Self { error, handle })
    }
}

/// Export information learned during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Export name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Transmission flags
    pub flags: TransmissionFlags,
    /// Minimum block size
    pub min_block_size: u32,
    /// Preferred block size
    pub preferred_block_size: u32,
    /// Maximum block size (largest single transfer)
    pub max_block_size: u32,
}

impl ExportInfo {
    /// Largest transfer assumed when the server advertises none
    pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 32 * 1024 * 1024; // 32 MB

    /// Create new export info
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            flags: TransmissionFlags::new(TransmissionFlags::HAS_FLAGS),
            min_block_size: 1,
            preferred_block_size: 4096,
            max_block_size: Self::DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    /// Set transmission flags
    pub fn with_flags(mut self, flags: TransmissionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Block size a client may use against this export.
    ///
    /// `requested` is kept when it is a multiple of the minimum block size;
    /// otherwise the preferred size, then the minimum, is used.
    pub fn usable_block_size(&self, requested: u32) -> u32 {
        let min = self.min_block_size.max(1);
        if requested != 0 && requested % min == 0 {
            requested
        } else if self.preferred_block_size != 0 && self.preferred_block_size % min == 0 {
            self.preferred_block_size
        } else {
            min
        }
    }

    /// Set block sizes
    pub fn block_sizes(mut self, min: u32, preferred: u32, max: u32) -> Self {
        self.min_block_size = min;
        self.preferred_block_size = preferred;
        self.max_block_size = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_flags_mirror_server() {
        let server = GlobalFlags::new(GlobalFlags::FIXED_NEWSTYLE | GlobalFlags::NO_ZEROES);
        let client = ClientFlags::for_server(server);
        assert_eq!(
            client.bits(),
            ClientFlags::FIXED_NEWSTYLE | ClientFlags::NO_ZEROES
        );

        let client = ClientFlags::for_server(GlobalFlags::new(0));
        assert_eq!(client.bits(), 0);
    }

    #[test]
    fn test_transmission_flags() {
        let flags = TransmissionFlags::new(
            TransmissionFlags::HAS_FLAGS | TransmissionFlags::READ_ONLY,
        );
        assert!(flags.is_read_only());
        assert!(!flags.can_flush());
        assert!(!flags.can_trim());
    }

    #[test]
    fn test_request_wire_layout() {
        let request = NbdRequest::new(NbdCommand::Write, 0x0102030405060708, 4096, 512);
        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        assert_eq!(buf.len(), NbdRequest::SIZE);
        assert_eq!(&buf[0..4], &NBD_REQUEST_MAGIC.to_be_bytes());
        assert_eq!(&buf[6..8], &1u16.to_be_bytes());
        assert_eq!(&buf[8..16], &0x0102030405060708u64.to_be_bytes());
        assert_eq!(&buf[16..24], &4096u64.to_be_bytes());
        assert_eq!(&buf[24..28], &512u32.to_be_bytes());

        let parsed = NbdRequest::parse(&buf).unwrap();
        assert_eq!(parsed.command, NbdCommand::Write);
        assert_eq!(parsed.offset, 4096);
    }

    #[test]
    fn test_reply_parse() {
        let mut buf = BytesMut::new();
        NbdReply::new(77, NbdError::NoSpc).encode(&mut buf);
        assert_eq!(buf.len(), NbdReply::SIZE);

        let reply = NbdReply::parse(&buf).unwrap();
        assert_eq!(reply.handle, 77);
        assert_eq!(reply.error, NbdError::NoSpc);
    }

    #[test]
    fn test_reply_rejects_structured_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(NBD_STRUCTURED_REPLY_MAGIC);
        buf.put_u32(0);
        buf.put_u64(1);

        assert!(matches!(
            NbdReply::parse(&buf),
            Err(BlockError::Protocol(_))
        ));
    }

    #[test]
    fn test_option_decoding_covers_client_options_only() {
        assert_eq!(NbdOption::try_from(1).unwrap(), NbdOption::ExportName);
        assert_eq!(NbdOption::try_from(7).unwrap(), NbdOption::Go);
        assert!(NbdOption::try_from(6).is_err());
        assert_eq!(CommandFlags::default().bits(), 0);
    }

    #[test]
    fn test_reply_type_decoding() {
        assert_eq!(NbdReplyType::try_from(1).unwrap(), NbdReplyType::Ack);
        assert_eq!(
            NbdReplyType::try_from((1 << 31) | 6).unwrap(),
            NbdReplyType::ErrUnknown
        );
        assert!(NbdReplyType::is_error_code((1 << 31) | 42));
        assert!(NbdReplyType::try_from(42).is_err());
    }

    #[test]
    fn test_export_info() {
        let info = ExportInfo::new("test", 1024 * 1024 * 1024).block_sizes(512, 4096, 1024 * 1024);

        assert_eq!(info.name, "test");
        assert_eq!(info.size, 1024 * 1024 * 1024);
        assert_eq!(info.preferred_block_size, 4096);
        assert_eq!(info.max_block_size, 1024 * 1024);
    }

    #[test]
    fn test_usable_block_size_respects_minimum() {
        let info = ExportInfo::new("test", 1 << 20).block_sizes(512, 4096, 1 << 20);
        assert_eq!(info.usable_block_size(1024), 1024);
        assert_eq!(info.usable_block_size(3), 4096);
        assert_eq!(info.usable_block_size(0), 4096);

        let odd = ExportInfo::new("test", 1 << 20).block_sizes(512, 1000, 1 << 20);
        assert_eq!(odd.usable_block_size(100), 512);

        let any = ExportInfo::new("test", 1 << 20);
        assert_eq!(any.usable_block_size(3), 3);
    }
}
