//! Client configuration
//!
//! Configuration for the NBD client device table. Values come from
//! defaults, then an optional TOML file, then `WARP_NBD_*` environment
//! overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};

/// Block size used until a caller sets one
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "WARP_NBD";

/// NBD client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of device slots (minors `0..devices`)
    pub devices: u32,
    /// Block size reported before a caller overrides it
    pub default_block_size: u32,
    /// Export requested during the handshake
    pub export_name: String,
    /// Transport connect timeout (ms)
    pub connect_timeout_ms: u64,
    /// Handshake timeout (ms)
    pub handshake_timeout_ms: u64,
    /// Socket write and reply timeout (ms)
    pub io_timeout_ms: u64,
    /// Disable Nagle on TCP transports
    pub nodelay: bool,
    /// Write buffer capacity for the per-connection writer
    pub write_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            devices: 16,
            default_block_size: DEFAULT_BLOCK_SIZE,
            export_name: String::new(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            nodelay: true,
            write_buffer_size: 256 * 1024,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of device slots
    pub fn devices(mut self, count: u32) -> Self {
        self.devices = count;
        self
    }

    /// Set default block size
    pub fn block_size(mut self, size: u32) -> Self {
        self.default_block_size = size;
        self
    }

    /// Set export name
    pub fn export_name(mut self, name: impl Into<String>) -> Self {
        self.export_name = name.into();
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the I/O timeout for socket writes and outstanding replies
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake timeout as a `Duration`
    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Write timeout as a `Duration`
    pub fn io_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Check invariants the device table relies on
    pub fn validate(&self) -> BlockResult<()> {
        if self.devices == 0 {
            return Err(BlockError::Config("devices must be at least 1".to_string()));
        }
        if self.default_block_size == 0 {
            return Err(BlockError::Config(
                "default_block_size must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(BlockError::Config("timeouts must be non-zero".to_string()));
        }
        if self.write_buffer_size == 0 {
            return Err(BlockError::Config(
                "write_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.export_name.len() > 4096 {
            return Err(BlockError::Config(format!(
                "export_name too long: {} bytes",
                self.export_name.len()
            )));
        }
        Ok(())
    }

    /// Parse from TOML text
    pub fn load_from_str(toml: &str) -> BlockResult<Self> {
        let config: Self = toml::from_str(toml).map_err(|e| BlockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> BlockResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| BlockError::Config(e.to_string()))?;
        let config = config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARP_NBD_*` environment overrides
    pub fn apply_env_overrides(mut self) -> BlockResult<Self> {
        if let Some(val) = env_var("DEVICES") {
            self.devices = parse_env("DEVICES", &val)?;
        }
        if let Some(val) = env_var("DEFAULT_BLOCK_SIZE") {
            self.default_block_size = parse_env("DEFAULT_BLOCK_SIZE", &val)?;
        }
        if let Some(val) = env_var("EXPORT_NAME") {
            self.export_name = val;
        }
        if let Some(val) = env_var("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_env("CONNECT_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = env_var("HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = parse_env("HANDSHAKE_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = env_var("IO_TIMEOUT_MS") {
            self.io_timeout_ms = parse_env("IO_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = env_var("NODELAY") {
            self.nodelay = parse_env("NODELAY", &val)?;
        }
        if let Some(val) = env_var("WRITE_BUFFER_SIZE") {
            self.write_buffer_size = parse_env("WRITE_BUFFER_SIZE", &val)?;
        }
        Ok(self)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{suffix}")).ok()
}

fn parse_env<T: std::str::FromStr>(suffix: &str, val: &str) -> BlockResult<T> {
    val.parse().map_err(|_| {
        BlockError::Config(format!("Invalid {ENV_PREFIX}_{suffix} value: {val}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new()
            .devices(4)
            .block_size(512)
            .export_name("vol0")
            .connect_timeout(Duration::from_secs(2));

        assert_eq!(config.devices, 4);
        assert_eq!(config.default_block_size, 512);
        assert_eq!(config.export_name, "vol0");
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_table() {
        let config = ClientConfig::new().devices(0);
        assert!(matches!(config.validate(), Err(BlockError::Config(_))));

        let config = ClientConfig::new().block_size(0);
        assert!(matches!(config.validate(), Err(BlockError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = ClientConfig::new().io_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BlockError::Config(_))));

        let config = ClientConfig::new().handshake_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BlockError::Config(_))));

        let config = ClientConfig {
            write_buffer_size: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(BlockError::Config(_))));
    }

    #[test]
    fn test_env_overrides_write_buffer_size() {
        std::env::set_var("WARP_NBD_WRITE_BUFFER_SIZE", "65536");
        let config = ClientConfig::new().apply_env_overrides();
        std::env::remove_var("WARP_NBD_WRITE_BUFFER_SIZE");
        assert_eq!(config.unwrap().write_buffer_size, 65536);
    }

    #[test]
    fn test_load_from_str_partial() {
        let config = ClientConfig::load_from_str(
            r#"
            devices = 2
            export_name = "scratch"
            "#,
        )
        .unwrap();

        assert_eq!(config.devices, 2);
        assert_eq!(config.export_name, "scratch");
        assert_eq!(config.default_block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_block_size = 1024").unwrap();
        writeln!(file, "io_timeout_ms = 500").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.default_block_size, 1024);
        assert_eq!(config.io_timeout_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let err = ClientConfig::load_from_str("devices = \"many\"").unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
    }
}
