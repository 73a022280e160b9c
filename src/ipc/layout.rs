//! Driver wire layout
//!
//! `#[repr(C)]` mirrors of the structures exchanged with `/dev/lite_ipc`,
//! plus the ioctl numbers and the numeric encodings of message kinds,
//! object types and registry commands. Field order and widths must match
//! the kernel bit for bit.

use core::ffi::c_void;
use core::mem::size_of;

// ============================================================================
// ioctl numbers
// ============================================================================

/// ioctl magic shared by every LiteIPC request
pub const IPC_IOC_MAGIC: u8 = b'i';

/// `_IO('i', 1)`, argument is the registry's max message size
pub const IPC_SET_CMS_NR: u8 = 1;
/// `_IOWR('i', 2, CmsCmdContent)`
pub const IPC_CMS_CMD_NR: u8 = 2;
/// `_IO('i', 3)`
pub const IPC_SET_IPC_THREAD_NR: u8 = 3;
/// `_IOWR('i', 4, IpcContent)`
pub const IPC_SEND_RECV_MSG_NR: u8 = 4;
/// `_IOR('i', 5, IpcVersion)`
pub const IPC_GET_VERSION_NR: u8 = 5;

// ============================================================================
// Numeric encodings
// ============================================================================

/// `IpcContent::flag` bits
pub const SEND: u32 = 1 << 0;
pub const RECV: u32 = 1 << 1;
pub const BUFF_FREE: u32 = 1 << 2;

/// `IpcMsg::type` values
pub const MT_REQUEST: u32 = 0;
pub const MT_REPLY: u32 = 1;
pub const MT_FAILED_REPLY: u32 = 2;
pub const MT_DEATH_NOTIFY: u32 = 3;

/// `IpcMsg::flag` values
pub const LITEIPC_FLAG_DEFAULT: u32 = 0;
pub const LITEIPC_FLAG_ONEWAY: u32 = 1;

/// `SpecialObj::type` values
pub const OBJ_FD: u32 = 0;
pub const OBJ_PTR: u32 = 1;
pub const OBJ_SVC: u32 = 2;

/// `CmsCmdContent::cmd` values
pub const CMS_GEN_HANDLE: u32 = 0;
pub const CMS_REMOVE_HANDLE: u32 = 1;
pub const CMS_ADD_ACCESS: u32 = 2;

// ============================================================================
// Structures
// ============================================================================

/// `SvcIdentity`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RawSvcIdentity {
    pub handle: u32,
    pub token: u32,
    pub cookie: u32,
}

/// `BuffPtr`
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawBuffPtr {
    pub buff_sz: u32,
    pub buff: *mut c_void,
}

/// `ObjContent`
#[derive(Clone, Copy)]
#[repr(C)]
pub union RawObjContent {
    pub fd: u32,
    pub ptr: RawBuffPtr,
    pub svc: RawSvcIdentity,
}

/// `SpecialObj`
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawSpecialObj {
    pub obj_type: u32,
    pub content: RawObjContent,
}

/// `IpcMsg`
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawIpcMsg {
    pub msg_type: u32,
    pub target: RawSvcIdentity,
    pub code: u32,
    pub flag: u32,
    #[cfg(feature = "timestamp")]
    pub timestamp: u64,
    pub data_sz: u32,
    pub data: *mut c_void,
    pub sp_obj_num: u32,
    pub offsets: *mut c_void,
    pub process_id: u32,
    pub task_id: u32,
    #[cfg(feature = "security")]
    pub user_id: u32,
    #[cfg(feature = "security")]
    pub gid: u32,
}

impl RawIpcMsg {
    /// An all-zero message with null data and offsets
    pub fn zeroed() -> Self {
        Self {
            msg_type: 0,
            target: RawSvcIdentity::default(),
            code: 0,
            flag: 0,
            #[cfg(feature = "timestamp")]
            timestamp: 0,
            data_sz: 0,
            data: core::ptr::null_mut(),
            sp_obj_num: 0,
            offsets: core::ptr::null_mut(),
            process_id: 0,
            task_id: 0,
            #[cfg(feature = "security")]
            user_id: 0,
            #[cfg(feature = "security")]
            gid: 0,
        }
    }
}

/// `IpcContent`, the argument of `IPC_SEND_RECV_MSG`
#[derive(Debug)]
#[repr(C)]
pub struct RawIpcContent {
    pub flag: u32,
    pub out_msg: *mut RawIpcMsg,
    pub in_msg: *mut RawIpcMsg,
    pub buff_to_free: *mut c_void,
}

/// `CmsCmdContent`, the argument of `IPC_CMS_CMD`
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawCmsCmdContent {
    pub cmd: u32,
    pub task_id: u32,
    pub service_handle: u32,
}

/// `IpcVersion`, the argument of `IPC_GET_VERSION`
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawIpcVersion {
    pub driver_version: u32,
}

/// Bytes a message header occupies in the receiver's pool
pub const MSG_HEADER_SIZE: usize = size_of::<RawIpcMsg>();

/// Bytes one special object occupies inside the data area
pub const SPECIAL_OBJ_SIZE: usize = size_of::<RawSpecialObj>();

/// Bytes one offsets entry occupies
pub const OFFSET_SIZE: usize = size_of::<u32>();
