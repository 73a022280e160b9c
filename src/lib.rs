//! LiteIPC - kernel-mediated message passing and the component management service
//!
//! This crate provides the user-side core of LiteIPC: the message model and
//! its wire framing, the transport binding to the kernel driver (both the
//! `/dev/lite_ipc` character device and an in-process simulated driver), a
//! blocking call/reply client library, and the CMS registry that maps service
//! names to kernel-issued handles.

// Registry and transport errors carry the rejected message size
#![allow(clippy::result_large_err)]

// Core types
pub mod types;

pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod ipc;
pub mod servers;

pub use client::{IpcClient, Outcome};
pub use config::IpcConfig;
pub use error::{IpcError, Result};
pub use ipc::message::{Message, MessageFlags, MessageKind, Routing, ServiceIdentity, SpecialObject};
pub use ipc::sim::{SimKernel, SimTransport};
pub use ipc::transport::{IpcFlags, RegistryCommand, Transport};
pub use servers::cms::{Registry, RegistryState};
pub use types::{ProcessId, TaskId};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name
pub const NAME: &str = "LiteIPC";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "LiteIPC");
        assert!(!VERSION.is_empty());
    }
}
