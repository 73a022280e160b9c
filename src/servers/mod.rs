//! System servers for LiteIPC
//!
//! The only system server is the CMS (component management service), the
//! name registry every task reaches at handle 0. This module holds the wire
//! protocol shared by the registry and its clients:
//!
//! - requests carry a [`CmsCode`] and a length-prefixed service name
//! - replies carry `(status, handle, token)` as little-endian words
//! - failed replies carry a [`RegistryStatus`]

pub mod cms;

use crate::error::{IpcError, Result};
use crate::ipc::message::{read_u32, ServiceIdentity};
use crate::ipc::NAME_LEN_MAX;

/// Bounded service name
pub type ServiceName = heapless::String<NAME_LEN_MAX>;

/// Registry operations
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmsCode {
    Register = 1,
    Get = 2,
    Unregister = 3,
    Stop = 4,
}

impl CmsCode {
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Register),
            2 => Some(Self::Get),
            3 => Some(Self::Unregister),
            4 => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Status word of a registry reply
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    Ok = 0,
    AlreadyRegistered = 1,
    NotFound = 2,
    AccessDenied = 3,
    InvalidMessage = 4,
    CommandFailed = 5,
}

impl RegistryStatus {
    pub fn from_raw(status: u32) -> Option<Self> {
        match status {
            0 => Some(Self::Ok),
            1 => Some(Self::AlreadyRegistered),
            2 => Some(Self::NotFound),
            3 => Some(Self::AccessDenied),
            4 => Some(Self::InvalidMessage),
            5 => Some(Self::CommandFailed),
            _ => None,
        }
    }

    /// Status the registry reports for a failed operation
    pub fn from_error(err: &IpcError) -> Self {
        match err {
            IpcError::AlreadyRegistered => Self::AlreadyRegistered,
            IpcError::NotFound => Self::NotFound,
            IpcError::AccessDenied { .. } => Self::AccessDenied,
            IpcError::InvalidMessage(_) => Self::InvalidMessage,
            _ => Self::CommandFailed,
        }
    }

    /// Client-side error for a failed-reply status word
    pub fn to_error(status: u32) -> IpcError {
        match Self::from_raw(status) {
            Some(Self::AlreadyRegistered) => IpcError::AlreadyRegistered,
            Some(Self::NotFound) => IpcError::NotFound,
            Some(Self::AccessDenied) => IpcError::AccessDenied { handle: 0 },
            Some(Self::InvalidMessage) => IpcError::invalid("registry rejected the request"),
            _ => IpcError::RemoteFailure { status },
        }
    }
}

/// Validate and bound a service name
pub fn service_name(name: &str) -> Result<ServiceName> {
    if name.is_empty() {
        return Err(IpcError::invalid("empty service name"));
    }
    let mut bounded = ServiceName::new();
    bounded
        .push_str(name)
        .map_err(|_| IpcError::invalid(format!("service name longer than {NAME_LEN_MAX} bytes")))?;
    Ok(bounded)
}

/// `[len: u32][bytes]`
pub fn encode_name(name: &ServiceName) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + name.len());
    payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload
}

pub fn decode_name(payload: &[u8]) -> Result<ServiceName> {
    let len = read_u32(payload, 0).ok_or_else(|| IpcError::invalid("missing name length"))? as usize;
    let bytes = 4usize
        .checked_add(len)
        .and_then(|end| payload.get(4..end))
        .ok_or_else(|| IpcError::invalid("name runs past payload"))?;
    let name = core::str::from_utf8(bytes).map_err(|_| IpcError::invalid("name is not utf-8"))?;
    service_name(name)
}

/// `(OK, handle, token)`
pub fn encode_identity(id: ServiceIdentity) -> Vec<u8> {
    [RegistryStatus::Ok as u32, id.handle, id.token]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

pub fn decode_identity(payload: &[u8]) -> Result<ServiceIdentity> {
    let status = read_u32(payload, 0).ok_or_else(|| IpcError::invalid("empty registry reply"))?;
    if status != RegistryStatus::Ok as u32 {
        return Err(RegistryStatus::to_error(status));
    }
    match (read_u32(payload, 1), read_u32(payload, 2)) {
        (Some(handle), Some(token)) => Ok(ServiceIdentity::new(handle, token)),
        _ => Err(IpcError::invalid("short registry reply")),
    }
}

/// `[handle: u32]`
pub fn encode_handle(handle: u32) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

pub fn decode_handle(payload: &[u8]) -> Result<u32> {
    read_u32(payload, 0).ok_or_else(|| IpcError::invalid("missing handle"))
}
