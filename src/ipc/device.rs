//! `/dev/lite_ipc` binding
//!
//! Talks to the real driver through `ioctl` and a read-only `mmap` of the
//! buffer pool. Outgoing messages are framed as payload followed by the
//! special objects, with an offsets array pointing at each object.
//! Received messages are copied out of the pool; the pool address of each
//! one is kept in an arena so that freeing it hands the driver the right
//! pointer.

use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use spin::Mutex;

use super::layout::{
    RawCmsCmdContent, RawIpcContent, RawIpcMsg, RawIpcVersion, RawObjContent, RawSpecialObj,
    RawBuffPtr, IPC_CMS_CMD_NR, IPC_GET_VERSION_NR, IPC_IOC_MAGIC, IPC_SEND_RECV_MSG_NR,
    IPC_SET_CMS_NR, IPC_SET_IPC_THREAD_NR, MSG_HEADER_SIZE, OBJ_FD, OBJ_PTR, OBJ_SVC,
    SPECIAL_OBJ_SIZE,
};
use super::message::{
    Message, MessageFlags, MessageKind, Routing, SenderInfo, ServiceIdentity, SpecialObject,
    SpecialObjects,
};
use super::pool::{BufferToken, Pool};
use super::transport::{IpcFlags, RegistryCommand, Transport};
use super::{validate_pool_size, DriverVersion, LITEIPC_DRIVER, MAX_PAYLOAD_SIZE, MAX_SPECIAL_OBJECTS};
use crate::error::{errno_to_error, IpcError, Result};
use crate::types::{ProcessId, TaskId};

mod ioctls {
    use super::*;

    nix::ioctl_write_int_bad!(ipc_set_cms, nix::request_code_none!(IPC_IOC_MAGIC, IPC_SET_CMS_NR));
    nix::ioctl_readwrite!(ipc_cms_cmd, IPC_IOC_MAGIC, IPC_CMS_CMD_NR, RawCmsCmdContent);
    nix::ioctl_none!(ipc_set_ipc_thread, IPC_IOC_MAGIC, IPC_SET_IPC_THREAD_NR);
    nix::ioctl_readwrite!(ipc_send_recv_msg, IPC_IOC_MAGIC, IPC_SEND_RECV_MSG_NR, RawIpcContent);
    nix::ioctl_read!(ipc_get_version, IPC_IOC_MAGIC, IPC_GET_VERSION_NR, RawIpcVersion);
}

/// A live pool mapping
#[derive(Debug)]
struct Mapping {
    addr: usize,
    len: usize,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(addr) = NonNull::new(self.addr as *mut c_void) {
            // SAFETY: addr/len came from a successful mmap and are unmapped once
            if let Err(err) = unsafe { munmap(addr, self.len) } {
                warn!(target: "liteipc::device", "munmap failed: {err}");
            }
        }
    }
}

/// Transport over the LiteIPC character device
#[derive(Debug)]
pub struct DeviceTransport {
    file: File,
    task: AtomicU32,
    ipc_thread: AtomicBool,
    mapping: Mutex<Option<Mapping>>,
    buffers: Mutex<Pool<usize>>,
}

impl DeviceTransport {
    /// Open the default device node
    pub fn open_default() -> Result<Self> {
        Self::open(LITEIPC_DRIVER)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| IpcError::DeviceUnavailable(format!("{}: {err}", path.display())))?;
        debug!(target: "liteipc::device", "opened {}", path.display());
        Ok(Self {
            file,
            task: AtomicU32::new(0),
            ipc_thread: AtomicBool::new(false),
            mapping: Mutex::new(None),
            buffers: Mutex::new(Pool::new(0, 0)),
        })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn send_recv(&self, flags: IpcFlags, out: Option<&mut Encoded>, free: Option<usize>) -> Result<*mut RawIpcMsg> {
        let mut content = RawIpcContent {
            flag: flags.bits(),
            out_msg: out.map_or(ptr::null_mut(), |e| &mut e.raw as *mut RawIpcMsg),
            in_msg: ptr::null_mut(),
            buff_to_free: free.map_or(ptr::null_mut(), |addr| addr as *mut c_void),
        };
        // SAFETY: content and everything it points to outlive the ioctl
        unsafe { ioctls::ipc_send_recv_msg(self.fd(), &mut content) }.map_err(|errno| match errno {
            Errno::ENOENT => IpcError::RemoteFailure { status: 0 },
            Errno::EINVAL if flags.contains(IpcFlags::SEND) && !flags.contains(IpcFlags::RECEIVE) => {
                IpcError::invalid("message rejected by driver")
            }
            other => errno_to_error(other as i32),
        })?;
        Ok(content.in_msg)
    }

    /// Hand a pool message back to the driver
    fn release(&self, addr: usize) {
        if let Err(err) = self.send_recv(IpcFlags::FREE_BUFFER, None, Some(addr)) {
            warn!(target: "liteipc::device", "freeing pool message {addr:#x} failed: {err}");
        }
    }

    /// Copy a message out of the pool and remember where it lives
    fn decode(&self, raw_ptr: *mut RawIpcMsg) -> Result<Message> {
        self.decode_or_release(raw_ptr, |addr| self.release(addr))
    }

    /// Like [`decode`](Self::decode), but a message that cannot be taken is
    /// passed to `release` so its pool bytes are not lost
    fn decode_or_release<R>(&self, raw_ptr: *mut RawIpcMsg, release: R) -> Result<Message>
    where
        R: FnOnce(usize),
    {
        if raw_ptr.is_null() {
            return Err(IpcError::invalid("driver returned no message"));
        }
        let tracked = self
            .parse(raw_ptr)
            .and_then(|msg| Ok((self.buffers.lock().alloc(0, raw_ptr as usize)?, msg)));
        match tracked {
            Ok((token, mut msg)) => {
                msg.set_buffer(token);
                Ok(msg)
            }
            Err(err) => {
                warn!(target: "liteipc::device", "dropping undecodable message: {err}");
                release(raw_ptr as usize);
                Err(err)
            }
        }
    }

    fn parse(&self, raw_ptr: *mut RawIpcMsg) -> Result<Message> {
        // SAFETY: the driver hands back a pointer into our mapped pool
        let raw = unsafe { ptr::read_unaligned(raw_ptr) };
        let kind = MessageKind::from_raw(raw.msg_type)
            .ok_or_else(|| IpcError::invalid(format!("unknown message type {}", raw.msg_type)))?;
        let data_sz = raw.data_sz as usize;
        let count = raw.sp_obj_num as usize;
        if count > MAX_SPECIAL_OBJECTS {
            return Err(IpcError::TooManySpecialObjects {
                count,
                max: MAX_SPECIAL_OBJECTS,
            });
        }
        let data: &[u8] = if data_sz == 0 || raw.data.is_null() {
            &[]
        } else {
            // SAFETY: data/data_sz describe a region of the mapped pool
            unsafe { core::slice::from_raw_parts(raw.data as *const u8, data_sz) }
        };
        if count > 0 && raw.offsets.is_null() {
            return Err(IpcError::invalid("special objects without offsets"));
        }
        let offsets: Vec<usize> = (0..count)
            .map(|i| {
                // SAFETY: offsets holds sp_obj_num u32 entries
                unsafe { ptr::read_unaligned((raw.offsets as *const u32).add(i)) as usize }
            })
            .collect();

        let payload_len = offsets.first().copied().unwrap_or(data_sz);
        let payload = data
            .get(..payload_len)
            .ok_or_else(|| IpcError::invalid("payload runs past data"))?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(IpcError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut objects = SpecialObjects::new();
        for offset in offsets {
            let bytes = offset
                .checked_add(SPECIAL_OBJ_SIZE)
                .and_then(|end| data.get(offset..end))
                .ok_or_else(|| IpcError::invalid("special object runs past data"))?;
            // SAFETY: bytes spans one whole RawSpecialObj
            let obj = unsafe { ptr::read_unaligned(bytes.as_ptr() as *const RawSpecialObj) };
            let decoded = decode_object(&obj)?;
            objects
                .push(decoded)
                .map_err(|_| IpcError::invalid("special object list overflow"))?;
        }

        let mut msg = Message::from_wire(
            Routing::from_raw(kind, raw.target),
            raw.code,
            MessageFlags::from_bits_truncate(raw.flag),
            payload.to_vec(),
        );
        if matches!(kind, MessageKind::Reply | MessageKind::FailedReply) {
            msg.set_echo_token(raw.target.token);
        }
        msg.replace_special_objects(objects);
        #[cfg(feature = "timestamp")]
        msg.set_timestamp(raw.timestamp);
        #[cfg(feature = "security")]
        msg.set_credentials(super::message::Credentials {
            uid: raw.user_id,
            gid: raw.gid,
        });
        msg.set_received(
            SenderInfo {
                process_id: ProcessId(raw.process_id),
                task_id: TaskId(raw.task_id),
            },
            None,
        );
        Ok(msg)
    }
}

fn decode_object(obj: &RawSpecialObj) -> Result<SpecialObject> {
    // SAFETY: obj_type selects the live union member
    unsafe {
        match obj.obj_type {
            OBJ_FD => Ok(SpecialObject::Fd(obj.content.fd as i32)),
            OBJ_PTR => {
                let buf = obj.content.ptr;
                if buf.buff.is_null() {
                    return Ok(SpecialObject::Buffer(Vec::new()));
                }
                let bytes = core::slice::from_raw_parts(buf.buff as *const u8, buf.buff_sz as usize);
                Ok(SpecialObject::Buffer(bytes.to_vec()))
            }
            OBJ_SVC => Ok(SpecialObject::Service(ServiceIdentity::from_raw(obj.content.svc))),
            other => Err(IpcError::invalid(format!("unknown special object type {other}"))),
        }
    }
}

/// An outgoing message laid out for the driver
///
/// Owns the data area, offsets and buffer copies that `raw` points into.
struct Encoded {
    raw: RawIpcMsg,
    _data: Vec<u8>,
    _offsets: Vec<u32>,
    _buffers: Vec<Vec<u8>>,
}

impl Encoded {
    fn new(msg: &Message) -> Result<Self> {
        let payload = msg.payload();
        let objects = msg.special_objects();
        let mut data = Vec::with_capacity(payload.len() + objects.len() * SPECIAL_OBJ_SIZE);
        data.extend_from_slice(payload);
        let mut offsets = Vec::with_capacity(objects.len());
        let mut buffers = Vec::new();

        for obj in objects {
            let raw = match obj {
                SpecialObject::Fd(fd) => RawSpecialObj {
                    obj_type: OBJ_FD,
                    content: RawObjContent { fd: *fd as u32 },
                },
                SpecialObject::Buffer(bytes) => {
                    let copy = bytes.clone();
                    let raw = RawSpecialObj {
                        obj_type: OBJ_PTR,
                        content: RawObjContent {
                            ptr: RawBuffPtr {
                                buff_sz: copy.len() as u32,
                                buff: copy.as_ptr() as *mut c_void,
                            },
                        },
                    };
                    buffers.push(copy);
                    raw
                }
                SpecialObject::Service(id) => RawSpecialObj {
                    obj_type: OBJ_SVC,
                    content: RawObjContent { svc: id.to_raw() },
                },
            };
            offsets.push(data.len() as u32);
            let start = data.len();
            data.resize(start + SPECIAL_OBJ_SIZE, 0);
            // SAFETY: the slot was just sized for one RawSpecialObj
            unsafe { ptr::write_unaligned(data.as_mut_ptr().add(start) as *mut RawSpecialObj, raw) };
        }

        let mut raw = RawIpcMsg::zeroed();
        raw.msg_type = msg.kind() as u32;
        raw.target = msg.routing().to_raw_target();
        if matches!(msg.kind(), MessageKind::Reply | MessageKind::FailedReply) {
            raw.target.token = msg.echo_token();
        }
        raw.code = msg.code();
        raw.flag = msg.flags().bits();
        #[cfg(feature = "timestamp")]
        {
            raw.timestamp = msg.timestamp();
        }
        raw.data_sz = data.len() as u32;
        raw.data = data.as_mut_ptr() as *mut c_void;
        raw.sp_obj_num = offsets.len() as u32;
        raw.offsets = if offsets.is_empty() {
            ptr::null_mut()
        } else {
            offsets.as_mut_ptr() as *mut c_void
        };
        Ok(Self {
            raw,
            _data: data,
            _offsets: offsets,
            _buffers: buffers,
        })
    }
}

impl Transport for DeviceTransport {
    fn task_id(&self) -> TaskId {
        TaskId(self.task.load(Ordering::Acquire))
    }

    fn map_pool(&self, size: usize) -> Result<()> {
        let mut mapping = self.mapping.lock();
        if mapping.is_some() {
            return Err(IpcError::AlreadyMapped);
        }
        validate_pool_size(size)?;
        let len = NonZeroUsize::new(size).ok_or(IpcError::InvalidSize { size })?;
        // SAFETY: fresh private read-only mapping of the device
        let addr = unsafe { mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, &self.file, 0) }
            .map_err(|errno| match errno {
                Errno::EEXIST => IpcError::AlreadyMapped,
                Errno::EINVAL => IpcError::InvalidSize { size },
                other => errno_to_error(other as i32),
            })?;
        *mapping = Some(Mapping {
            addr: addr.as_ptr() as usize,
            len: size,
        });
        *self.buffers.lock() = Pool::new(self.fd() as u32, size);
        debug!(target: "liteipc::device", "mapped {size} byte pool");
        Ok(())
    }

    fn call(
        &self,
        flags: IpcFlags,
        out_msg: Option<Message>,
        free_target: Option<BufferToken>,
    ) -> Result<Option<Message>> {
        if self.mapping.lock().is_none() {
            return Err(IpcError::PoolNotMapped);
        }
        let mut encoded = match out_msg {
            Some(msg) => {
                msg.validate()?;
                Some(Encoded::new(&msg)?)
            }
            None => None,
        };
        let free_addr = match free_target {
            Some(token) => Some(*self.buffers.lock().get(token)?),
            None => None,
        };

        let in_msg = self.send_recv(flags, encoded.as_mut(), free_addr)?;
        if let Some(token) = free_target {
            self.buffers.lock().free(token)?;
        }
        if !flags.contains(IpcFlags::RECEIVE) {
            return Ok(None);
        }
        let msg = self.decode(in_msg)?;
        if msg.kind() == MessageKind::FailedReply {
            let status = msg.failure_status().unwrap_or(u32::MAX);
            if let Some(token) = msg.buffer() {
                self.call(IpcFlags::FREE_BUFFER, None, Some(token))?;
            }
            return Err(IpcError::RemoteFailure { status });
        }
        Ok(Some(msg))
    }

    fn set_as_registry(&self, max_message_size: usize) -> Result<()> {
        if max_message_size < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidSize {
                size: max_message_size,
            });
        }
        let arg = max_message_size
            .try_into()
            .map_err(|_| IpcError::InvalidSize {
                size: max_message_size,
            })?;
        // SAFETY: plain integer argument
        unsafe { ioctls::ipc_set_cms(self.fd(), arg) }.map_err(|errno| match errno {
            Errno::EEXIST => IpcError::AlreadyElected,
            Errno::EINVAL => IpcError::InvalidSize {
                size: max_message_size,
            },
            other => errno_to_error(other as i32),
        })?;
        Ok(())
    }

    fn registry_command(&self, cmd: RegistryCommand) -> Result<ServiceIdentity> {
        let mut content = cmd.to_raw();
        let handle = content.service_handle;
        // SAFETY: content is a valid CmsCmdContent for the duration of the call
        unsafe { ioctls::ipc_cms_cmd(self.fd(), &mut content as *mut RawCmsCmdContent) }.map_err(
            |errno| match errno {
                Errno::EACCES => IpcError::NotElected,
                Errno::EINVAL => IpcError::InvalidTarget { handle },
                other => errno_to_error(other as i32),
            },
        )?;
        // The driver has no per-handle tokens
        Ok(ServiceIdentity::new(content.service_handle, 0))
    }

    fn set_ipc_thread(&self) -> Result<TaskId> {
        if self.ipc_thread.load(Ordering::Acquire) {
            return Err(IpcError::IpcThreadAlreadySet);
        }
        // SAFETY: no argument
        let task = unsafe { ioctls::ipc_set_ipc_thread(self.fd()) }.map_err(|errno| match errno {
            Errno::EINVAL => IpcError::NoRegistry,
            other => errno_to_error(other as i32),
        })?;
        self.ipc_thread.store(true, Ordering::Release);
        self.task.store(task as u32, Ordering::Release);
        Ok(TaskId(task as u32))
    }

    fn driver_version(&self) -> Result<DriverVersion> {
        let mut version = RawIpcVersion::default();
        // SAFETY: version is a valid IpcVersion for the duration of the call
        unsafe { ioctls::ipc_get_version(self.fd(), &mut version as *mut RawIpcVersion) }?;
        Ok(DriverVersion::from_raw(version.driver_version))
    }

    fn close(&self) -> Result<()> {
        self.mapping.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::layout;

    #[test]
    fn missing_device_is_unavailable() {
        let err = DeviceTransport::open("/nonexistent/lite_ipc").unwrap_err();
        assert!(matches!(err, IpcError::DeviceUnavailable(_)));
    }

    #[test]
    fn encoded_payload_precedes_objects() {
        let msg = Message::oneway(ServiceIdentity::new(5, 9), 3, b"abc".to_vec())
            .unwrap()
            .with_special_objects(vec![
                SpecialObject::Fd(4),
                SpecialObject::Service(ServiceIdentity::new(6, 2)),
            ])
            .unwrap();
        let encoded = Encoded::new(&msg).unwrap();
        assert_eq!(encoded.raw.data_sz as usize, 3 + 2 * SPECIAL_OBJ_SIZE);
        assert_eq!(encoded._offsets, vec![3, 3 + SPECIAL_OBJ_SIZE as u32]);
        assert_eq!(encoded.raw.target.handle, 5);
        assert_eq!(encoded.raw.flag, 1);

        let second = &encoded._data[3 + SPECIAL_OBJ_SIZE..];
        let obj = unsafe { ptr::read_unaligned(second.as_ptr() as *const RawSpecialObj) };
        assert_eq!(decode_object(&obj), Ok(SpecialObject::Service(ServiceIdentity::new(6, 2))));
    }

    fn null_device() -> DeviceTransport {
        DeviceTransport::open("/dev/null").unwrap()
    }

    #[test]
    fn undecodable_messages_go_back_to_the_driver() {
        let device = null_device();
        let mut unknown = RawIpcMsg::zeroed();
        unknown.msg_type = 99;
        let mut crowded = RawIpcMsg::zeroed();
        crowded.msg_type = layout::MT_REQUEST;
        crowded.sp_obj_num = (MAX_SPECIAL_OBJECTS + 1) as u32;

        for raw in [&mut unknown, &mut crowded] {
            let addr = raw as *mut RawIpcMsg;
            let mut released = None;
            assert!(device.decode_or_release(addr, |a| released = Some(a)).is_err());
            assert_eq!(released, Some(addr as usize));
        }
        assert_eq!(device.buffers.lock().live(), 0);
    }

    #[test]
    fn decoded_messages_keep_their_pool_address() {
        let device = null_device();
        let mut payload = *b"ping";
        let mut raw = RawIpcMsg::zeroed();
        raw.msg_type = layout::MT_REQUEST;
        raw.target.handle = 4;
        raw.code = 1;
        raw.data_sz = payload.len() as u32;
        raw.data = payload.as_mut_ptr() as *mut c_void;
        let addr = &mut raw as *mut RawIpcMsg;

        let mut released = false;
        let msg = device.decode_or_release(addr, |_| released = true).unwrap();
        assert!(!released);
        assert_eq!(msg.payload(), b"ping");
        let token = msg.buffer().unwrap();
        assert_eq!(device.buffers.lock().get(token).copied(), Ok(addr as usize));
    }

    #[test]
    fn buffer_object_points_at_owned_copy() {
        let msg = Message::oneway(ServiceIdentity::CMS, 1, Vec::new())
            .unwrap()
            .with_special_objects(vec![SpecialObject::Buffer(vec![1, 2, 3])])
            .unwrap();
        let encoded = Encoded::new(&msg).unwrap();
        let obj = unsafe { ptr::read_unaligned(encoded._data.as_ptr() as *const RawSpecialObj) };
        assert_eq!(decode_object(&obj), Ok(SpecialObject::Buffer(vec![1, 2, 3])));
    }
}
