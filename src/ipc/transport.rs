//! Transport binding to the LiteIPC driver
//!
//! [`Transport`] is the seam between the user-side core and the kernel. The
//! device binding talks to `/dev/lite_ipc`; the simulated binding runs the
//! same rules in process.

use bitflags::bitflags;

use super::layout;
use super::message::{Message, ServiceIdentity};
use super::pool::BufferToken;
use super::DriverVersion;
use crate::error::Result;
use crate::types::TaskId;

bitflags! {
    /// What a single `call` does, encoded in `IpcContent::flag`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        const SEND = layout::SEND;
        const RECEIVE = layout::RECV;
        const FREE_BUFFER = layout::BUFF_FREE;
    }
}

impl IpcFlags {
    /// Blocking request/reply
    pub const CALL: Self = Self::SEND.union(Self::RECEIVE);
    /// Answer a received request and release its buffer
    pub const REPLY: Self = Self::SEND.union(Self::FREE_BUFFER);
}

/// Privileged handle-table commands, issued by the registry only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryCommand {
    /// Mint a handle owned by `task`
    GenerateHandle { task: TaskId },
    /// Retire `handle`; its token becomes stale
    RemoveHandle { handle: u32 },
    /// Allow `task` to call `handle`
    GrantAccess { task: TaskId, handle: u32 },
}

impl RegistryCommand {
    /// `(cmd, taskID, serviceHandle)` as carried by `CmsCmdContent`
    pub fn to_raw(self) -> layout::RawCmsCmdContent {
        match self {
            RegistryCommand::GenerateHandle { task } => layout::RawCmsCmdContent {
                cmd: layout::CMS_GEN_HANDLE,
                task_id: task.0,
                service_handle: 0,
            },
            RegistryCommand::RemoveHandle { handle } => layout::RawCmsCmdContent {
                cmd: layout::CMS_REMOVE_HANDLE,
                task_id: 0,
                service_handle: handle,
            },
            RegistryCommand::GrantAccess { task, handle } => layout::RawCmsCmdContent {
                cmd: layout::CMS_ADD_ACCESS,
                task_id: task.0,
                service_handle: handle,
            },
        }
    }
}

/// Kernel driver operations
///
/// Every method requires a mapped pool. `call` and `set_ipc_thread`
/// additionally require an elected registry.
pub trait Transport: Send + Sync {
    /// Task this transport speaks for
    fn task_id(&self) -> TaskId;

    /// Map the read-only buffer pool; once per task
    fn map_pool(&self, size: usize) -> Result<()>;

    /// Multiplexed send / receive / free
    ///
    /// * `SEND | RECEIVE` with a request blocks for the correlated reply.
    /// * `RECEIVE` alone blocks for the next request or death notification.
    /// * `SEND | FREE_BUFFER` answers the request backing `free_target`.
    /// * `FREE_BUFFER` alone releases `free_target`.
    fn call(
        &self,
        flags: IpcFlags,
        out_msg: Option<Message>,
        free_target: Option<BufferToken>,
    ) -> Result<Option<Message>>;

    /// Become the registry; messages to handle 0 may not exceed `max_message_size`
    fn set_as_registry(&self, max_message_size: usize) -> Result<()>;

    /// Registry-only handle table command
    fn registry_command(&self, cmd: RegistryCommand) -> Result<ServiceIdentity>;

    /// Receive death notifications on this task
    fn set_ipc_thread(&self) -> Result<TaskId>;

    fn driver_version(&self) -> Result<DriverVersion>;

    /// Release the task's driver state
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_driver() {
        assert_eq!(IpcFlags::CALL.bits(), 0b011);
        assert_eq!(IpcFlags::REPLY.bits(), 0b101);
        assert_eq!(IpcFlags::FREE_BUFFER.bits(), 4);
    }

    #[test]
    fn registry_command_encoding() {
        let raw = RegistryCommand::GrantAccess {
            task: TaskId(7),
            handle: 3,
        }
        .to_raw();
        assert_eq!((raw.cmd, raw.task_id, raw.service_handle), (2, 7, 3));
        assert_eq!(
            RegistryCommand::RemoveHandle { handle: 9 }.to_raw().cmd,
            layout::CMS_REMOVE_HANDLE
        );
    }
}
