//! Exclusive-open admission control
//!
//! One owner per device. Closing clears the I/O-facing configuration but
//! leaves the connection alone, so a later open can resume I/O at once.

use tracing::debug;

use crate::device::{Device, DeviceTable, Minor, OwnerId};
use crate::error::{BlockError, BlockResult};

impl Device {
    /// Take exclusive ownership
    pub fn open(&self, owner: OwnerId) -> BlockResult<()> {
        let mut state = self.lock();
        if let Some(holder) = state.opened_by {
            return Err(BlockError::Busy(format!(
                "device {} is open by {}",
                self.minor(),
                holder
            )));
        }
        state.opened_by = Some(owner);
        drop(state);

        debug!("Device {} opened by {}", self.minor(), owner);
        Ok(())
    }

    /// Release ownership held by `owner`
    pub fn close(&self, owner: OwnerId) -> BlockResult<()> {
        let mut state = self.lock();
        if state.opened_by != Some(owner) {
            return Err(BlockError::InvalidArgument(format!(
                "device {} is not open by {}",
                self.minor(),
                owner
            )));
        }
        state.opened_by = None;
        state.client_block_size = match &state.export {
            Some(export) => export.usable_block_size(self.default_block_size()),
            None => self.default_block_size(),
        };
        drop(state);

        debug!("Device {} closed by {}", self.minor(), owner);
        Ok(())
    }
}

impl DeviceTable {
    /// Open device `minor` exclusively for `owner`
    pub fn open(&self, minor: Minor, owner: OwnerId) -> BlockResult<()> {
        self.lookup(minor)?.open(owner)
    }

    /// Close device `minor` on behalf of `owner`
    pub fn close(&self, minor: Minor, owner: OwnerId) -> BlockResult<()> {
        self.lookup(minor)?.close(owner)
    }
}
