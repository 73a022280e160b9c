//! LiteIPC message passing
//!
//! All communication goes through the kernel driver: a task maps a read-only
//! buffer pool, then sends and receives messages addressed to service handles
//! with one multiplexed request.

pub mod layout;
pub mod message;
pub mod pool;
pub mod sim;
pub mod transport;

#[cfg(unix)]
pub mod device;

use core::time::Duration;

/// Character device exposed by the driver
pub const LITEIPC_DRIVER: &str = "/dev/lite_ipc";

/// Largest payload a single message may carry
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Largest number of special objects a single message may carry
pub const MAX_SPECIAL_OBJECTS: usize = 8;

/// Longest service name accepted by the registry
pub const NAME_LEN_MAX: usize = 32;

/// Page granularity of the buffer pool
pub const PAGE_SIZE: usize = 4096;

/// Pool size used when the caller does not choose one (64 KiB)
pub const POOL_DEFAULT_SIZE: usize = 16 * PAGE_SIZE;

/// Largest pool a task may map (256 KiB)
pub const POOL_MAX_SIZE: usize = 64 * PAGE_SIZE;

/// How long a blocking call waits for its reply
pub const CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Driver protocol version reported by `driver_version`
pub const DRIVER_VERSION_MAJOR: u16 = 2;
pub const DRIVER_VERSION_MINOR: u16 = 0;

/// Driver protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DriverVersion {
    pub major: u16,
    pub minor: u16,
}

impl DriverVersion {
    /// Version implemented by this crate
    pub const CURRENT: Self = Self {
        major: DRIVER_VERSION_MAJOR,
        minor: DRIVER_VERSION_MINOR,
    };

    /// Decode the packed `major | minor << 16` word
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw & 0xffff) as u16,
            minor: (raw >> 16) as u16,
        }
    }

    /// Pack as `major | minor << 16`
    pub fn to_raw(self) -> u32 {
        self.major as u32 | (self.minor as u32) << 16
    }
}

/// Check a pool size against the mapping rules
pub fn validate_pool_size(size: usize) -> crate::Result<()> {
    if size == 0 || size % PAGE_SIZE != 0 || size > POOL_MAX_SIZE {
        return Err(crate::IpcError::InvalidSize { size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_rules() {
        assert!(validate_pool_size(POOL_DEFAULT_SIZE).is_ok());
        assert!(validate_pool_size(POOL_MAX_SIZE).is_ok());
        assert!(validate_pool_size(0).is_err());
        assert!(validate_pool_size(PAGE_SIZE + 1).is_err());
        assert!(validate_pool_size(POOL_MAX_SIZE + PAGE_SIZE).is_err());
    }

    #[test]
    fn driver_version_packing() {
        let v = DriverVersion::from_raw(2 | 3 << 16);
        assert_eq!(v, DriverVersion { major: 2, minor: 3 });
        assert_eq!(v.to_raw(), 2 | 3 << 16);
        assert_eq!(DriverVersion::CURRENT.to_raw(), 2);
    }
}
