//! Runtime configuration
//!
//! Compile-time knobs are Cargo features (`timestamp`, `security`); the
//! values below can be set in code or read from the environment.

use core::time::Duration;

use crate::error::{IpcError, Result};
use crate::ipc::layout::MSG_HEADER_SIZE;
use crate::ipc::{self, CALL_TIMEOUT, PAGE_SIZE, POOL_DEFAULT_SIZE};

/// Pool size in pages
pub const ENV_POOL_PAGES: &str = "LITEIPC_POOL_PAGES";
/// Call timeout in milliseconds
pub const ENV_CALL_TIMEOUT_MS: &str = "LITEIPC_CALL_TIMEOUT_MS";
/// Registry message ceiling in bytes
pub const ENV_CMS_MAX_MSG_SIZE: &str = "LITEIPC_CMS_MAX_MSG_SIZE";

/// Per-task IPC settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Bytes mapped for the buffer pool; page multiple, at most 256 KiB
    pub pool_size: usize,
    /// How long a blocking call waits for its reply
    pub call_timeout: Duration,
    /// Largest message the registry accepts, header included
    pub cms_max_message_size: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            pool_size: POOL_DEFAULT_SIZE,
            call_timeout: CALL_TIMEOUT,
            cms_max_message_size: PAGE_SIZE,
        }
    }
}

impl IpcConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_cms_max_message_size(mut self, size: usize) -> Self {
        self.cms_max_message_size = size;
        self
    }

    /// Check every value against the driver's limits
    pub fn validate(&self) -> Result<()> {
        ipc::validate_pool_size(self.pool_size)?;
        if self.cms_max_message_size < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidSize {
                size: self.cms_max_message_size,
            });
        }
        if self.call_timeout.is_zero() {
            return Err(IpcError::InvalidConfig("call timeout must be positive".into()));
        }
        Ok(())
    }

    /// Defaults overridden by `LITEIPC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(pages) = lookup(ENV_POOL_PAGES) {
            config.pool_size = parse::<usize>(ENV_POOL_PAGES, &pages)? * PAGE_SIZE;
        }
        if let Some(ms) = lookup(ENV_CALL_TIMEOUT_MS) {
            config.call_timeout = Duration::from_millis(parse(ENV_CALL_TIMEOUT_MS, &ms)?);
        }
        if let Some(size) = lookup(ENV_CMS_MAX_MSG_SIZE) {
            config.cms_max_message_size = parse(ENV_CMS_MAX_MSG_SIZE, &size)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: core::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| IpcError::InvalidConfig(format!("{key}={value:?} is not a number")))
}
