//! LiteIPC message model
//!
//! A message is routed either to a service (requests) or back to the task
//! that sent a request (replies). The routing and the message kind travel
//! together in [`Routing`], so a reply can never be addressed to a service
//! handle by mistake.

use bitflags::bitflags;

use super::layout::{self, RawSvcIdentity};
use super::pool::BufferToken;
use super::{MAX_PAYLOAD_SIZE, MAX_SPECIAL_OBJECTS};
use crate::error::{IpcError, Result};
use crate::types::{ProcessId, TaskId};

/// File descriptor carried by a special object
pub type Fd = i32;

// ============================================================================
// Service identity
// ============================================================================

/// Kernel-issued name for a service
///
/// Equality covers `handle`, `token` and `cookie`; [`same_service`]
/// ignores the caller-chosen cookie. A handle whose token no longer matches
/// the kernel's table is stale.
///
/// [`same_service`]: ServiceIdentity::same_service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ServiceIdentity {
    pub handle: u32,
    pub token: u32,
    pub cookie: u32,
}

impl ServiceIdentity {
    /// The registry is always reachable at handle 0
    pub const CMS: Self = Self::new(0, 0);

    /// Placeholder asking the kernel to mint a fresh handle for the sender
    pub const ANONYMOUS: Self = Self::new(u32::MAX, 1);

    pub const fn new(handle: u32, token: u32) -> Self {
        Self {
            handle,
            token,
            cookie: 0,
        }
    }

    pub const fn with_cookie(self, cookie: u32) -> Self {
        Self { cookie, ..self }
    }

    pub fn is_cms(&self) -> bool {
        self.handle == 0
    }

    pub fn is_anonymous(&self) -> bool {
        self.handle == Self::ANONYMOUS.handle && self.token == Self::ANONYMOUS.token
    }

    /// Same handle and token, whatever the cookie
    pub fn same_service(&self, other: &Self) -> bool {
        self.handle == other.handle && self.token == other.token
    }

    pub fn to_raw(self) -> RawSvcIdentity {
        RawSvcIdentity {
            handle: self.handle,
            token: self.token,
            cookie: self.cookie,
        }
    }

    pub fn from_raw(raw: RawSvcIdentity) -> Self {
        Self {
            handle: raw.handle,
            token: raw.token,
            cookie: raw.cookie,
        }
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Message kind, as encoded in `IpcMsg::type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    Request = layout::MT_REQUEST,
    Reply = layout::MT_REPLY,
    FailedReply = layout::MT_FAILED_REPLY,
    DeathNotify = layout::MT_DEATH_NOTIFY,
}

impl MessageKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            layout::MT_REQUEST => Some(Self::Request),
            layout::MT_REPLY => Some(Self::Reply),
            layout::MT_FAILED_REPLY => Some(Self::FailedReply),
            layout::MT_DEATH_NOTIFY => Some(Self::DeathNotify),
            _ => None,
        }
    }
}

/// Where a message goes, tied to what it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Call into a service
    Request(ServiceIdentity),
    /// Answer to the task that issued a request
    Reply(TaskId),
    /// Negative answer to the task that issued a request
    FailedReply(TaskId),
    /// `task` exited while owning `handle`
    DeathNotify { task: TaskId, handle: u32 },
}

impl Routing {
    pub fn kind(&self) -> MessageKind {
        match self {
            Routing::Request(_) => MessageKind::Request,
            Routing::Reply(_) => MessageKind::Reply,
            Routing::FailedReply(_) => MessageKind::FailedReply,
            Routing::DeathNotify { .. } => MessageKind::DeathNotify,
        }
    }

    /// The `target` triple as the driver encodes it
    pub fn to_raw_target(&self) -> RawSvcIdentity {
        match *self {
            Routing::Request(id) => id.to_raw(),
            Routing::Reply(task) | Routing::FailedReply(task) => RawSvcIdentity {
                handle: task.0,
                token: 0,
                cookie: 0,
            },
            Routing::DeathNotify { task, handle } => RawSvcIdentity {
                handle: task.0,
                token: handle,
                cookie: 0,
            },
        }
    }

    /// Rebuild routing from a decoded kind and target
    pub fn from_raw(kind: MessageKind, target: RawSvcIdentity) -> Self {
        match kind {
            MessageKind::Request => Routing::Request(ServiceIdentity::from_raw(target)),
            MessageKind::Reply => Routing::Reply(TaskId(target.handle)),
            MessageKind::FailedReply => Routing::FailedReply(TaskId(target.handle)),
            MessageKind::DeathNotify => Routing::DeathNotify {
                task: TaskId(target.handle),
                handle: target.token,
            },
        }
    }
}

bitflags! {
    /// Per-message flags, encoded in `IpcMsg::flag`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// The request expects no reply
        const ONEWAY = layout::LITEIPC_FLAG_ONEWAY;
    }
}

// ============================================================================
// Special objects
// ============================================================================

/// Out-of-band object translated by the kernel on delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialObject {
    /// Duplicated into the receiver's descriptor table
    Fd(Fd),
    /// Copied into the receiver's pool
    Buffer(Vec<u8>),
    /// Receiver is granted access to the service
    Service(ServiceIdentity),
}

impl SpecialObject {
    /// Extra pool bytes this object costs the receiver
    pub fn pool_cost(&self) -> usize {
        match self {
            SpecialObject::Buffer(bytes) => bytes.len(),
            _ => 0,
        }
    }
}

/// Bounded list of special objects
pub type SpecialObjects = heapless::Vec<SpecialObject, MAX_SPECIAL_OBJECTS>;

/// Collect special objects, rejecting lists over the per-message limit
pub fn special_objects_from(objects: Vec<SpecialObject>) -> Result<SpecialObjects> {
    let count = objects.len();
    if count > MAX_SPECIAL_OBJECTS {
        return Err(IpcError::TooManySpecialObjects {
            count,
            max: MAX_SPECIAL_OBJECTS,
        });
    }
    let mut bounded = SpecialObjects::new();
    for obj in objects {
        bounded
            .push(obj)
            .map_err(|_| IpcError::TooManySpecialObjects {
                count,
                max: MAX_SPECIAL_OBJECTS,
            })?;
    }
    Ok(bounded)
}

// ============================================================================
// Message
// ============================================================================

/// Sender of a received message, filled in by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub process_id: ProcessId,
    pub task_id: TaskId,
}

/// Sender credentials, filled in by the kernel
#[cfg(feature = "security")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// What a reply must echo to be matched with its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "timestamp", allow(dead_code))]
pub(crate) struct Correlation {
    code: u32,
    token: u32,
    #[cfg(feature = "timestamp")]
    timestamp: u64,
}

impl Correlation {
    #[cfg(feature = "timestamp")]
    pub(crate) fn matches(&self, other: &Correlation) -> bool {
        self.timestamp == other.timestamp
    }

    #[cfg(not(feature = "timestamp"))]
    pub(crate) fn matches(&self, other: &Correlation) -> bool {
        self.code == other.code && self.token == other.token
    }
}

/// A LiteIPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    routing: Routing,
    code: u32,
    flags: MessageFlags,
    payload: Vec<u8>,
    special_objects: SpecialObjects,
    /// Token of the request a reply answers
    echo_token: u32,
    sender: Option<SenderInfo>,
    buffer: Option<BufferToken>,
    #[cfg(feature = "timestamp")]
    timestamp: u64,
    #[cfg(feature = "security")]
    credentials: Credentials,
}

impl Message {
    fn new(routing: Routing, code: u32, flags: MessageFlags, payload: Vec<u8>) -> Result<Self> {
        check_payload(payload.len())?;
        Ok(Self {
            routing,
            code,
            flags,
            payload,
            special_objects: SpecialObjects::new(),
            echo_token: 0,
            sender: None,
            buffer: None,
            #[cfg(feature = "timestamp")]
            timestamp: 0,
            #[cfg(feature = "security")]
            credentials: Credentials::default(),
        })
    }

    /// Request that expects a reply
    pub fn request(target: ServiceIdentity, code: u32, payload: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(Routing::Request(target), code, MessageFlags::empty(), payload.into())
    }

    /// Request that expects no reply
    pub fn oneway(target: ServiceIdentity, code: u32, payload: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(Routing::Request(target), code, MessageFlags::ONEWAY, payload.into())
    }

    /// Reply addressed to the task that sent `request`
    pub fn reply_to(request: &Message, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let task = request.reply_target()?;
        let mut reply = Self::new(Routing::Reply(task), request.code, MessageFlags::empty(), payload.into())?;
        reply.echo(request);
        Ok(reply)
    }

    /// Failed reply carrying `status` as its first payload word
    pub fn failed_reply_to(request: &Message, status: u32) -> Result<Self> {
        let task = request.reply_target()?;
        let mut reply = Self::new(
            Routing::FailedReply(task),
            request.code,
            MessageFlags::empty(),
            status.to_le_bytes().to_vec(),
        )?;
        reply.echo(request);
        Ok(reply)
    }

    /// Kernel-originated notice that `task` exited while owning `handle`
    pub(crate) fn death_notify(task: TaskId, handle: u32) -> Self {
        Self {
            routing: Routing::DeathNotify { task, handle },
            code: 0,
            flags: MessageFlags::ONEWAY,
            payload: Vec::new(),
            special_objects: SpecialObjects::new(),
            echo_token: 0,
            sender: None,
            buffer: None,
            #[cfg(feature = "timestamp")]
            timestamp: 0,
            #[cfg(feature = "security")]
            credentials: Credentials::default(),
        }
    }

    fn reply_target(&self) -> Result<TaskId> {
        if self.kind() != MessageKind::Request {
            return Err(IpcError::invalid("only requests can be answered"));
        }
        if self.is_oneway() {
            return Err(IpcError::invalid("one-way requests take no reply"));
        }
        self.sender
            .map(|s| s.task_id)
            .ok_or_else(|| IpcError::invalid("request has no sender"))
    }

    fn echo(&mut self, request: &Message) {
        self.echo_token = request.target().map(|t| t.token).unwrap_or(0);
        #[cfg(feature = "timestamp")]
        {
            self.timestamp = request.timestamp;
        }
    }

    /// Attach a special object
    pub fn push_special_object(&mut self, obj: SpecialObject) -> Result<()> {
        self.special_objects
            .push(obj)
            .map_err(|_| IpcError::TooManySpecialObjects {
                count: MAX_SPECIAL_OBJECTS + 1,
                max: MAX_SPECIAL_OBJECTS,
            })
    }

    /// Attach a list of special objects, replacing any already attached
    pub fn with_special_objects(mut self, objects: Vec<SpecialObject>) -> Result<Self> {
        self.special_objects = special_objects_from(objects)?;
        Ok(self)
    }

    /// Check size ceilings
    pub fn validate(&self) -> Result<()> {
        check_payload(self.payload.len())?;
        if self.special_objects.len() > MAX_SPECIAL_OBJECTS {
            return Err(IpcError::TooManySpecialObjects {
                count: self.special_objects.len(),
                max: MAX_SPECIAL_OBJECTS,
            });
        }
        Ok(())
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn kind(&self) -> MessageKind {
        self.routing.kind()
    }

    /// Service a request is addressed to
    pub fn target(&self) -> Option<ServiceIdentity> {
        match self.routing {
            Routing::Request(id) => Some(id),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn is_oneway(&self) -> bool {
        self.flags.contains(MessageFlags::ONEWAY)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn special_objects(&self) -> &[SpecialObject] {
        &self.special_objects
    }

    /// Filled in by the transport on receipt
    pub fn sender(&self) -> Option<SenderInfo> {
        self.sender
    }

    /// Pool allocation backing a received message
    pub fn buffer(&self) -> Option<BufferToken> {
        self.buffer
    }

    /// Status word of a failed reply
    pub fn failure_status(&self) -> Option<u32> {
        if self.kind() != MessageKind::FailedReply {
            return None;
        }
        read_u32(&self.payload, 0)
    }

    #[cfg(feature = "timestamp")]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[cfg(feature = "security")]
    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    // ------------------------------------------------------------------------
    // Transport-side accessors
    // ------------------------------------------------------------------------

    pub(crate) fn correlation(&self) -> Correlation {
        let token = match self.routing {
            Routing::Request(id) => id.token,
            _ => self.echo_token,
        };
        Correlation {
            code: self.code,
            token,
            #[cfg(feature = "timestamp")]
            timestamp: self.timestamp,
        }
    }

    pub(crate) fn echo_token(&self) -> u32 {
        self.echo_token
    }

    pub(crate) fn set_echo_token(&mut self, token: u32) {
        self.echo_token = token;
    }

    pub(crate) fn set_received(&mut self, sender: SenderInfo, buffer: Option<BufferToken>) {
        self.sender = Some(sender);
        self.buffer = buffer;
    }

    #[cfg(unix)]
    pub(crate) fn set_buffer(&mut self, buffer: BufferToken) {
        self.buffer = Some(buffer);
    }

    pub(crate) fn replace_special_objects(&mut self, objects: SpecialObjects) {
        self.special_objects = objects;
    }

    /// Rebuild a message decoded from the wire
    pub(crate) fn from_wire(routing: Routing, code: u32, flags: MessageFlags, payload: Vec<u8>) -> Self {
        let mut msg = Self::death_notify(TaskId(0), 0);
        msg.routing = routing;
        msg.code = code;
        msg.flags = flags;
        msg.payload = payload;
        msg
    }

    #[cfg(feature = "timestamp")]
    pub(crate) fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    #[cfg(feature = "security")]
    pub(crate) fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }
}

fn check_payload(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(IpcError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Little-endian u32 at word index `word`
pub fn read_u32(bytes: &[u8], word: usize) -> Option<u32> {
    let start = word * 4;
    let chunk = bytes.get(start..start + 4)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
