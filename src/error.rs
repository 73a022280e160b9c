//! Error types for LiteIPC operations

use thiserror::Error;

/// Result type for IPC operations
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors that can occur during IPC operations
///
/// No operation in this crate panics on a kernel-reported failure; every
/// rejection surfaces as one of these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// The driver could not be opened, or the task has been closed
    #[error("ipc device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The buffer pool is mapped at most once per task
    #[error("buffer pool already mapped")]
    AlreadyMapped,

    /// Pool size or registry message size out of range
    #[error("invalid size: {size} bytes")]
    InvalidSize { size: usize },

    /// Every driver request needs a mapped buffer pool
    #[error("buffer pool not mapped")]
    PoolNotMapped,

    /// The receiver's pool has no room for the message
    #[error("buffer pool exhausted: {requested} bytes requested, {available} available")]
    PoolExhausted { requested: usize, available: usize },

    /// Another task is already the registry
    #[error("a registry has already been elected")]
    AlreadyElected,

    /// Registry commands are reserved for the elected registry
    #[error("caller is not the elected registry")]
    NotElected,

    /// No registry has been elected yet
    #[error("no registry elected")]
    NoRegistry,

    /// The calling task already receives death notifications
    #[error("ipc thread already set")]
    IpcThreadAlreadySet,

    /// Unknown handle, stale token, or a dead destination task
    #[error("invalid target: handle {handle}")]
    InvalidTarget { handle: u32 },

    /// The caller was never granted access to this handle
    #[error("access denied to handle {handle}")]
    AccessDenied { handle: u32 },

    /// No matching reply arrived within the call timeout
    #[error("call timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// Payload or registry message exceeds its ceiling
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// More special objects than a message may carry
    #[error("too many special objects: {count} (max: {max})")]
    TooManySpecialObjects { count: usize, max: usize },

    /// A live registry entry already uses this name
    #[error("service name already registered")]
    AlreadyRegistered,

    /// No live registry entry has this name
    #[error("service not found")]
    NotFound,

    /// The buffer was released earlier
    #[error("buffer already freed")]
    BufferAlreadyFreed,

    /// The buffer token does not belong to this task's pool
    #[error("invalid buffer token")]
    InvalidBuffer,

    /// Malformed message or illegal flag combination
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer answered with a failed reply
    #[error("remote failure: status {status}")]
    RemoteFailure { status: u32 },

    /// Unmapped OS error from the device
    #[error("os error: errno {0}")]
    Os(i32),

    /// Unparseable or out-of-range configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IpcError {
    /// Shorthand for [`IpcError::InvalidMessage`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        IpcError::InvalidMessage(reason.into())
    }
}

/// Convert a driver errno to an IpcError
///
/// `EEXIST` is ambiguous at this level (pool or registry) and is resolved by
/// the caller, which knows which request produced it.
#[cfg(unix)]
pub fn errno_to_error(errno: i32) -> IpcError {
    match errno {
        libc::EEXIST => IpcError::AlreadyMapped,
        libc::EACCES => IpcError::AccessDenied { handle: 0 },
        libc::ETIME => IpcError::TimedOut { timeout_ms: 0 },
        libc::ENOENT => IpcError::RemoteFailure { status: 0 },
        libc::ENOMEM => IpcError::PoolNotMapped,
        libc::EINVAL => IpcError::invalid("rejected by driver"),
        libc::ENODEV | libc::ENXIO | libc::EBADF => {
            IpcError::DeviceUnavailable(format!("errno {errno}"))
        }
        other => IpcError::Os(other),
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for IpcError {
    fn from(err: nix::errno::Errno) -> Self {
        errno_to_error(err as i32)
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::DeviceUnavailable(err.to_string())
    }
}
