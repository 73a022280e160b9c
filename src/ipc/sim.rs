//! In-process LiteIPC driver
//!
//! [`SimKernel`] keeps the driver's state (tasks, pools, the handle table,
//! per-task access sets and message queues) behind one `spin::Mutex` and
//! applies the same rules as the kernel driver. Blocking receives park the
//! calling thread on the task's wait queue; senders unpark it.
//!
//! Each [`SimTransport`] speaks for one task. Clones share the task; when the
//! last clone is dropped (or [`Transport::close`] is called) the task exits,
//! its queue is drained, and every task holding access to one of its handles
//! that has set an ipc thread receives a death notification.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use spin::Mutex;

use super::layout::{MSG_HEADER_SIZE, OFFSET_SIZE, SPECIAL_OBJ_SIZE};
use super::message::{
    Correlation, Fd, Message, MessageKind, Routing, SenderInfo, ServiceIdentity, SpecialObject,
    SpecialObjects,
};
use super::pool::{BufferToken, Pool};
use super::transport::{IpcFlags, RegistryCommand, Transport};
use super::{validate_pool_size, DriverVersion};
use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::types::{ProcessId, TaskId};

#[cfg(feature = "security")]
use super::message::Credentials;

/// First descriptor number handed out by the simulated fd tables
const FD_BASE: Fd = 3;

// ============================================================================
// Kernel state
// ============================================================================

/// Objects a delivery installed in the receiver, undone if it is dropped unread
#[derive(Debug, Clone, Default)]
struct Grants {
    fds: Vec<Fd>,
    access: Vec<u32>,
    minted: Vec<u32>,
}

/// What the kernel remembers about a message sitting in a pool
#[derive(Debug)]
struct Delivery {
    kind: MessageKind,
    oneway: bool,
    sender: TaskId,
    correlation: Correlation,
    /// Outstanding call a request waits on, if it expects a reply
    call: Option<u64>,
    sent_at: Instant,
    grants: Grants,
}

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    owner: TaskId,
    token: u32,
}

#[derive(Debug, Clone, Copy)]
struct RegistryInfo {
    task: TaskId,
    max_message_size: usize,
}

#[derive(Debug)]
struct TaskState {
    process_id: ProcessId,
    pool: Option<Pool<Delivery>>,
    queue: VecDeque<Message>,
    /// Calls still waiting for their reply
    pending: BTreeSet<u64>,
    /// Replies delivered to calls that have not picked them up yet
    answered: BTreeMap<u64, Message>,
    access: BTreeSet<u32>,
    ipc_thread: bool,
    waiters: Vec<Thread>,
    fds: BTreeSet<Fd>,
    calls: u64,
    #[cfg(feature = "security")]
    credentials: Credentials,
}

impl TaskState {
    fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            pool: None,
            queue: VecDeque::new(),
            pending: BTreeSet::new(),
            answered: BTreeMap::new(),
            access: BTreeSet::new(),
            ipc_thread: false,
            waiters: Vec::new(),
            fds: BTreeSet::new(),
            calls: 0,
            #[cfg(feature = "security")]
            credentials: Credentials::default(),
        }
    }
}

#[derive(Debug)]
struct KernelState {
    running: bool,
    next_task: u32,
    next_pool: u32,
    next_handle: u32,
    next_token: u32,
    next_fd: Fd,
    next_call: u64,
    last_stamp: u64,
    tasks: BTreeMap<TaskId, TaskState>,
    handles: BTreeMap<u32, HandleEntry>,
    registry: Option<RegistryInfo>,
}

fn closed(task: TaskId) -> IpcError {
    IpcError::DeviceUnavailable(format!("{task} is closed"))
}

/// Pool bytes a message occupies on the receiving side
fn wire_size(msg: &Message) -> usize {
    let objects = msg.special_objects();
    MSG_HEADER_SIZE
        + msg.payload().len()
        + objects.len() * (SPECIAL_OBJ_SIZE + OFFSET_SIZE)
        + objects.iter().map(SpecialObject::pool_cost).sum::<usize>()
}

impl KernelState {
    fn new() -> Self {
        Self {
            running: true,
            next_task: 1,
            next_pool: 1,
            next_handle: 1,
            next_token: 1,
            next_fd: FD_BASE,
            next_call: 1,
            last_stamp: 0,
            tasks: BTreeMap::new(),
            handles: BTreeMap::new(),
            registry: None,
        }
    }

    fn task(&self, id: TaskId) -> Result<&TaskState> {
        self.tasks.get(&id).ok_or_else(|| closed(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskState> {
        self.tasks.get_mut(&id).ok_or_else(|| closed(id))
    }

    /// Account one driver request and apply the mapped-pool precondition
    fn enter(&mut self, id: TaskId, needs_pool: bool) -> Result<&mut TaskState> {
        let task = self.task_mut(id)?;
        task.calls += 1;
        if needs_pool && task.pool.is_none() {
            return Err(IpcError::PoolNotMapped);
        }
        Ok(task)
    }

    fn require_registry(&self) -> Result<RegistryInfo> {
        self.registry.ok_or(IpcError::NoRegistry)
    }

    fn has_access(&self, task: TaskId, handle: u32) -> bool {
        handle == 0 || self.tasks.get(&task).is_some_and(|t| t.access.contains(&handle))
    }

    fn identity(&self, handle: u32) -> Result<ServiceIdentity> {
        self.handles
            .get(&handle)
            .map(|entry| ServiceIdentity::new(handle, entry.token))
            .ok_or(IpcError::InvalidTarget { handle })
    }

    /// Task serving `target`, if `sender` may call it
    fn resolve(&self, sender: TaskId, target: ServiceIdentity) -> Result<TaskId> {
        let handle = target.handle;
        let entry = self.handles.get(&handle).ok_or(IpcError::InvalidTarget { handle })?;
        if !self.has_access(sender, handle) {
            return Err(IpcError::AccessDenied { handle });
        }
        if entry.token != target.token || !self.tasks.contains_key(&entry.owner) {
            return Err(IpcError::InvalidTarget { handle });
        }
        Ok(entry.owner)
    }

    fn mint_handle(&mut self, owner: TaskId) -> ServiceIdentity {
        let handle = self.next_handle;
        let token = self.next_token;
        self.next_handle += 1;
        self.next_token += 1;
        self.handles.insert(handle, HandleEntry { owner, token });
        ServiceIdentity::new(handle, token)
    }

    fn retire_handle(&mut self, handle: u32) -> Option<HandleEntry> {
        let entry = self.handles.remove(&handle)?;
        for task in self.tasks.values_mut() {
            task.access.remove(&handle);
        }
        Some(entry)
    }

    /// Translate special objects for `receiver`; all or nothing
    fn translate_objects(
        &mut self,
        sender: TaskId,
        receiver: TaskId,
        objects: &[SpecialObject],
    ) -> Result<(SpecialObjects, Grants)> {
        let mut translated = SpecialObjects::new();
        let mut grants = Grants::default();
        for obj in objects {
            let result = self.translate_object(sender, receiver, obj, &mut grants);
            let pushed = result.and_then(|obj| {
                translated
                    .push(obj)
                    .map_err(|_| IpcError::invalid("special object list overflow"))
            });
            if let Err(err) = pushed {
                self.rollback(receiver, &grants);
                return Err(err);
            }
        }
        Ok((translated, grants))
    }

    fn translate_object(
        &mut self,
        sender: TaskId,
        receiver: TaskId,
        obj: &SpecialObject,
        grants: &mut Grants,
    ) -> Result<SpecialObject> {
        match obj {
            SpecialObject::Fd(fd) => {
                if !self.task(sender)?.fds.contains(fd) {
                    return Err(IpcError::invalid(format!("fd {fd} is not open in {sender}")));
                }
                let dup = self.next_fd;
                self.next_fd += 1;
                self.task_mut(receiver)?.fds.insert(dup);
                grants.fds.push(dup);
                Ok(SpecialObject::Fd(dup))
            }
            SpecialObject::Buffer(bytes) => Ok(SpecialObject::Buffer(bytes.clone())),
            SpecialObject::Service(id) if id.is_anonymous() => {
                let minted = self.mint_handle(sender).with_cookie(id.cookie);
                grants.minted.push(minted.handle);
                if self.task_mut(receiver)?.access.insert(minted.handle) {
                    grants.access.push(minted.handle);
                }
                Ok(SpecialObject::Service(minted))
            }
            SpecialObject::Service(id) => {
                self.resolve(sender, *id)?;
                if self.task_mut(receiver)?.access.insert(id.handle) {
                    grants.access.push(id.handle);
                }
                Ok(SpecialObject::Service(*id))
            }
        }
    }

    fn rollback(&mut self, receiver: TaskId, grants: &Grants) {
        if let Some(task) = self.tasks.get_mut(&receiver) {
            for fd in &grants.fds {
                task.fds.remove(fd);
            }
            for handle in &grants.access {
                task.access.remove(handle);
            }
        }
        for handle in &grants.minted {
            self.retire_handle(*handle);
        }
    }

    /// Copy `msg` into the receiver's pool and queue it
    ///
    /// A reply to `call` is filed under that call instead of the queue.
    fn deliver(
        &mut self,
        sender: SenderInfo,
        receiver: TaskId,
        mut msg: Message,
        call: Option<u64>,
    ) -> Result<()> {
        let size = wire_size(&msg);
        let (objects, grants) =
            self.translate_objects(sender.task_id, receiver, msg.special_objects())?;
        let delivery = Delivery {
            kind: msg.kind(),
            oneway: msg.is_oneway(),
            sender: sender.task_id,
            correlation: msg.correlation(),
            call: call.filter(|_| msg.kind() == MessageKind::Request),
            sent_at: Instant::now(),
            grants: grants.clone(),
        };
        let allocated = match self.tasks.get_mut(&receiver).and_then(|t| t.pool.as_mut()) {
            Some(pool) => pool.alloc(size, delivery),
            None => Err(IpcError::PoolExhausted {
                requested: size,
                available: 0,
            }),
        };
        let token = match allocated {
            Ok(token) => token,
            Err(err) => {
                self.rollback(receiver, &grants);
                return Err(err);
            }
        };
        msg.replace_special_objects(objects);
        msg.set_received(sender, Some(token));
        #[cfg(feature = "security")]
        {
            let credentials = self.tasks.get(&sender.task_id).map(|t| t.credentials);
            msg.set_credentials(credentials.unwrap_or_default());
        }
        let task = self.task_mut(receiver)?;
        trace!(
            target: "liteipc::sim",
            "deliver {:?} code {} from {} to {receiver} ({size} bytes)",
            msg.kind(),
            msg.code(),
            sender.task_id
        );
        match call.filter(|_| msg.kind() != MessageKind::Request) {
            Some(call) => {
                task.answered.insert(call, msg);
            }
            None => task.queue.push_back(msg),
        }
        for waiter in task.waiters.drain(..) {
            waiter.unpark();
        }
        Ok(())
    }

    /// Drop a queued message: undo its objects and release its pool bytes
    fn discard(&mut self, task: TaskId, msg: &Message) {
        let Some(token) = msg.buffer() else { return };
        let delivery = self
            .tasks
            .get_mut(&task)
            .and_then(|t| t.pool.as_mut())
            .and_then(|pool| pool.free(token).ok());
        if let Some(delivery) = delivery {
            self.rollback(task, &delivery.grants);
        }
    }

    fn free_buffer(&mut self, task: TaskId, token: BufferToken) -> Result<()> {
        let pool = self.task_mut(task)?.pool.as_mut().ok_or(IpcError::PoolNotMapped)?;
        pool.free(token)?;
        Ok(())
    }

    fn sender_info(&self, id: TaskId) -> Result<SenderInfo> {
        Ok(SenderInfo {
            process_id: self.task(id)?.process_id,
            task_id: id,
        })
    }

    /// Queue a request; returns the call id when the sender waits for a reply
    fn send_request(&mut self, sender: TaskId, mut msg: Message, now_ns: u64) -> Result<Option<u64>> {
        let target = msg.target().ok_or_else(|| IpcError::invalid("request without target"))?;
        let receiver = self.resolve(sender, target)?;
        if target.is_cms() {
            let registry = self.require_registry()?;
            let size = wire_size(&msg);
            if size > registry.max_message_size {
                return Err(IpcError::PayloadTooLarge {
                    size,
                    max: registry.max_message_size,
                });
            }
        }
        // Strictly increasing so no two requests share a stamp
        let stamp = now_ns.max(self.last_stamp + 1);
        self.last_stamp = stamp;
        #[cfg(feature = "timestamp")]
        msg.set_timestamp(stamp);
        #[cfg(not(feature = "timestamp"))]
        let _ = stamp;
        let call = (!msg.is_oneway()).then(|| {
            let call = self.next_call;
            self.next_call += 1;
            call
        });
        let info = self.sender_info(sender)?;
        if let Some(call) = call {
            self.task_mut(sender)?.pending.insert(call);
        }
        if let Err(err) = self.deliver(info, receiver, msg, call) {
            if let (Some(call), Ok(task)) = (call, self.task_mut(sender)) {
                task.pending.remove(&call);
            }
            return Err(err);
        }
        Ok(call)
    }

    /// A reply must answer the request held in `token`, in time; yields the
    /// call it completes
    fn check_reply(
        &self,
        replier: TaskId,
        msg: &Message,
        dest: TaskId,
        token: BufferToken,
        timeout: Duration,
    ) -> Result<u64> {
        let pool = self.task(replier)?.pool.as_ref().ok_or(IpcError::PoolNotMapped)?;
        let request = pool.get(token)?;
        if request.kind != MessageKind::Request || request.oneway {
            return Err(IpcError::invalid("buffer does not hold a request awaiting reply"));
        }
        if request.sender != dest {
            return Err(IpcError::invalid("reply is not addressed to the requesting task"));
        }
        if !msg.correlation().matches(&request.correlation) {
            return Err(IpcError::invalid("reply does not echo its request"));
        }
        let call = request
            .call
            .ok_or_else(|| IpcError::invalid("buffer does not hold a request awaiting reply"))?;
        let caller = self.tasks.get(&dest).ok_or(IpcError::InvalidTarget { handle: dest.0 })?;
        // The caller gave up on this call
        if request.sent_at.elapsed() > timeout || !caller.pending.contains(&call) {
            return Err(IpcError::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(call)
    }

    /// Tear down an exiting task and notify holders of its handles
    fn exit_task(&mut self, id: TaskId) -> Vec<Thread> {
        let Some(mut task) = self.tasks.remove(&id) else {
            return Vec::new();
        };
        debug!(target: "liteipc::sim", "{id} exiting with {} queued messages", task.queue.len());
        if let Some(mut pool) = task.pool.take() {
            for delivery in pool.drain() {
                for handle in &delivery.grants.minted {
                    self.retire_handle(*handle);
                }
            }
        }
        if self.registry.is_some_and(|r| r.task == id) {
            self.registry = None;
            self.handles.remove(&0);
        }

        let owned: Vec<u32> = self
            .handles
            .iter()
            .filter(|(_, entry)| entry.owner == id)
            .map(|(handle, _)| *handle)
            .collect();
        let sender = SenderInfo {
            process_id: task.process_id,
            task_id: id,
        };
        for handle in owned {
            let watchers: Vec<TaskId> = self
                .tasks
                .iter()
                .filter(|(_, t)| t.ipc_thread && t.access.contains(&handle))
                .map(|(tid, _)| *tid)
                .collect();
            for watcher in watchers {
                if let Err(err) = self.deliver(sender, watcher, Message::death_notify(id, handle), None) {
                    warn!(target: "liteipc::sim", "death notify for handle {handle} to {watcher} lost: {err}");
                }
            }
        }
        task.waiters
    }
}

// ============================================================================
// Simulated kernel
// ============================================================================

#[derive(Debug)]
struct Kernel {
    state: Mutex<KernelState>,
    call_timeout: Duration,
    epoch: Instant,
}

impl Kernel {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn timed_out(&self) -> IpcError {
        IpcError::TimedOut {
            timeout_ms: self.call_timeout.as_millis() as u64,
        }
    }

    fn terminate(&self, id: TaskId) {
        let waiters = self.state.lock().exit_task(id);
        for waiter in waiters {
            waiter.unpark();
        }
    }
}

/// The in-process driver shared by every simulated task
#[derive(Debug, Clone)]
pub struct SimKernel {
    kernel: Arc<Kernel>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_config(&IpcConfig::default())
    }

    /// Driver honoring `config.call_timeout`
    pub fn with_config(config: &IpcConfig) -> Self {
        Self {
            kernel: Arc::new(Kernel {
                state: Mutex::new(KernelState::new()),
                call_timeout: config.call_timeout,
                epoch: Instant::now(),
            }),
        }
    }

    /// Open the device for a new task
    pub fn open_task(&self) -> Result<SimTransport> {
        let mut state = self.kernel.state.lock();
        if !state.running {
            return Err(IpcError::DeviceUnavailable("driver shut down".into()));
        }
        let id = TaskId(state.next_task);
        state.next_task += 1;
        state.tasks.insert(id, TaskState::new(ProcessId(id.0)));
        debug!(target: "liteipc::sim", "opened {id}");
        Ok(SimTransport {
            task: Arc::new(TaskGuard {
                kernel: Arc::clone(&self.kernel),
                id,
            }),
        })
    }

    /// Exit `task` as if its process died
    pub fn terminate_task(&self, task: TaskId) {
        self.kernel.terminate(task);
    }

    /// Refuse new opens and exit every task
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = {
            let mut state = self.kernel.state.lock();
            state.running = false;
            state.tasks.keys().copied().collect()
        };
        for id in ids {
            self.kernel.terminate(id);
        }
    }

    /// Driver requests `task` has made
    pub fn transport_calls(&self, task: TaskId) -> u64 {
        self.kernel.state.lock().tasks.get(&task).map_or(0, |t| t.calls)
    }

    /// Open a fresh descriptor in `task`'s table
    pub fn install_fd(&self, task: TaskId) -> Result<Fd> {
        let mut state = self.kernel.state.lock();
        let fd = state.next_fd;
        state.task_mut(task)?.fds.insert(fd);
        state.next_fd += 1;
        Ok(fd)
    }

    pub fn fd_exists(&self, task: TaskId, fd: Fd) -> bool {
        self.kernel.state.lock().tasks.get(&task).is_some_and(|t| t.fds.contains(&fd))
    }

    pub fn has_access(&self, task: TaskId, handle: u32) -> bool {
        let state = self.kernel.state.lock();
        state.tasks.contains_key(&task) && state.has_access(task, handle)
    }

    /// `(used, capacity)` of `task`'s pool
    pub fn pool_usage(&self, task: TaskId) -> Option<(usize, usize)> {
        let state = self.kernel.state.lock();
        let pool = state.tasks.get(&task)?.pool.as_ref()?;
        Some((pool.used(), pool.capacity()))
    }

    /// Messages waiting in `task`'s queue
    pub fn queued(&self, task: TaskId) -> usize {
        self.kernel.state.lock().tasks.get(&task).map_or(0, |t| t.queue.len())
    }

    pub fn is_alive(&self, task: TaskId) -> bool {
        self.kernel.state.lock().tasks.contains_key(&task)
    }

    pub fn registry_task(&self) -> Option<TaskId> {
        self.kernel.state.lock().registry.map(|r| r.task)
    }

    /// Credentials stamped on every message `task` sends
    #[cfg(feature = "security")]
    pub fn set_credentials(&self, task: TaskId, credentials: Credentials) -> Result<()> {
        self.kernel.state.lock().task_mut(task)?.credentials = credentials;
        Ok(())
    }
}

// ============================================================================
// Per-task transport
// ============================================================================

#[derive(Debug)]
struct TaskGuard {
    kernel: Arc<Kernel>,
    id: TaskId,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.kernel.terminate(self.id);
    }
}

/// One task's view of the simulated driver
#[derive(Debug, Clone)]
pub struct SimTransport {
    task: Arc<TaskGuard>,
}

impl SimTransport {
    fn kernel(&self) -> &Kernel {
        &self.task.kernel
    }

    /// Park until `pick` yields a result, the deadline passes, or the task exits
    ///
    /// `leave` runs under the same lock as the final `pick`, whatever the
    /// outcome.
    fn block_on<F, L>(&self, deadline: Option<Instant>, mut pick: F, leave: L) -> Result<Message>
    where
        F: FnMut(&mut KernelState, TaskId) -> Option<Result<Message>>,
        L: FnOnce(&mut KernelState, TaskId),
    {
        let id = self.task.id;
        let me = thread::current();
        loop {
            {
                let mut state = self.kernel().state.lock();
                let Some(task) = state.tasks.get_mut(&id) else {
                    return Err(closed(id));
                };
                task.waiters.retain(|t| t.id() != me.id());
                let result = pick(&mut *state, id).or_else(|| {
                    deadline
                        .is_some_and(|d| Instant::now() >= d)
                        .then(|| Err(self.kernel().timed_out()))
                });
                if let Some(result) = result {
                    leave(&mut *state, id);
                    return result;
                }
                state.task_mut(id)?.waiters.push(me.clone());
            }
            match deadline {
                Some(d) => thread::park_timeout(d.saturating_duration_since(Instant::now())),
                None => thread::park(),
            }
        }
    }

    fn wait_reply(&self, call: u64) -> Result<Message> {
        let deadline = Instant::now() + self.kernel().call_timeout;
        self.block_on(
            Some(deadline),
            |state, id| {
                let msg = state.tasks.get_mut(&id)?.answered.remove(&call)?;
                if msg.kind() == MessageKind::FailedReply {
                    state.discard(id, &msg);
                    let status = msg.failure_status().unwrap_or(u32::MAX);
                    return Some(Err(IpcError::RemoteFailure { status }));
                }
                Some(Ok(msg))
            },
            |state, id| {
                let stale = state.tasks.get_mut(&id).and_then(|task| {
                    task.pending.remove(&call);
                    task.answered.remove(&call)
                });
                if let Some(msg) = stale {
                    warn!(target: "liteipc::sim", "{id} dropping unclaimed {:?}", msg.kind());
                    state.discard(id, &msg);
                }
            },
        )
    }

    fn wait_request(&self) -> Result<Message> {
        self.block_on(
            None,
            |state, id| state.tasks.get_mut(&id)?.queue.pop_front().map(Ok),
            |_, _| {},
        )
    }
}

impl Transport for SimTransport {
    fn task_id(&self) -> TaskId {
        self.task.id
    }

    fn map_pool(&self, size: usize) -> Result<()> {
        let mut state = self.kernel().state.lock();
        let pool_id = state.next_pool;
        let task = state.enter(self.task.id, false)?;
        if task.pool.is_some() {
            return Err(IpcError::AlreadyMapped);
        }
        validate_pool_size(size)?;
        task.pool = Some(Pool::new(pool_id, size));
        state.next_pool += 1;
        debug!(target: "liteipc::sim", "{} mapped {size} byte pool", self.task.id);
        Ok(())
    }

    fn call(
        &self,
        flags: IpcFlags,
        out_msg: Option<Message>,
        free_target: Option<BufferToken>,
    ) -> Result<Option<Message>> {
        let id = self.task.id;
        let kernel = self.kernel();
        let mut pending = None;
        {
            let mut state = kernel.state.lock();
            state.enter(id, true)?;
            state.require_registry()?;
            if flags.is_empty() {
                return Err(IpcError::invalid("no operation requested"));
            }
            let free_target = match (flags.contains(IpcFlags::FREE_BUFFER), free_target) {
                (true, Some(token)) => Some(token),
                (true, None) => return Err(IpcError::InvalidBuffer),
                (false, Some(_)) => return Err(IpcError::invalid("buffer given without FREE_BUFFER")),
                (false, None) => None,
            };

            match (flags.contains(IpcFlags::SEND), out_msg) {
                (true, Some(msg)) => {
                    msg.validate()?;
                    match msg.routing() {
                        Routing::Request(_) => {
                            let wants_reply = !msg.is_oneway();
                            if wants_reply != flags.contains(IpcFlags::RECEIVE) {
                                return Err(IpcError::invalid(
                                    "a request waits for its reply unless it is one-way",
                                ));
                            }
                            if let Some(token) = free_target {
                                state.free_buffer(id, token)?;
                            }
                            pending = state.send_request(id, msg, kernel.now_ns())?;
                        }
                        Routing::Reply(dest) | Routing::FailedReply(dest) => {
                            let token = free_target.ok_or_else(|| {
                                IpcError::invalid("a reply must free the request it answers")
                            })?;
                            let call = state.check_reply(id, &msg, dest, token, kernel.call_timeout)?;
                            let info = state.sender_info(id)?;
                            // The request stays held until its answer is in the caller's pool
                            state.deliver(info, dest, msg, Some(call))?;
                            state.free_buffer(id, token)?;
                        }
                        Routing::DeathNotify { .. } => {
                            return Err(IpcError::invalid("death notifications come from the kernel"));
                        }
                    }
                }
                (true, None) => return Err(IpcError::invalid("SEND without a message")),
                (false, Some(_)) => return Err(IpcError::invalid("message given without SEND")),
                (false, None) => {
                    if let Some(token) = free_target {
                        state.free_buffer(id, token)?;
                    }
                }
            }
        }

        if !flags.contains(IpcFlags::RECEIVE) {
            return Ok(None);
        }
        match pending {
            Some(call) => self.wait_reply(call).map(Some),
            None => self.wait_request().map(Some),
        }
    }

    fn set_as_registry(&self, max_message_size: usize) -> Result<()> {
        let mut state = self.kernel().state.lock();
        state.enter(self.task.id, true)?;
        if max_message_size < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidSize {
                size: max_message_size,
            });
        }
        if state.registry.is_some() {
            return Err(IpcError::AlreadyElected);
        }
        state.registry = Some(RegistryInfo {
            task: self.task.id,
            max_message_size,
        });
        state.handles.insert(
            0,
            HandleEntry {
                owner: self.task.id,
                token: 0,
            },
        );
        debug!(target: "liteipc::sim", "{} elected registry", self.task.id);
        Ok(())
    }

    fn registry_command(&self, cmd: RegistryCommand) -> Result<ServiceIdentity> {
        let mut state = self.kernel().state.lock();
        state.enter(self.task.id, true)?;
        let registry = state.registry.filter(|r| r.task == self.task.id);
        let registry = registry.ok_or(IpcError::NotElected)?;
        trace!(target: "liteipc::sim", "registry command {cmd:?}");
        match cmd {
            RegistryCommand::GenerateHandle { task } => {
                if !state.tasks.contains_key(&task) {
                    return Err(IpcError::InvalidTarget { handle: task.0 });
                }
                let identity = state.mint_handle(task);
                state.task_mut(registry.task)?.access.insert(identity.handle);
                Ok(identity)
            }
            RegistryCommand::RemoveHandle { handle } => {
                if handle == 0 {
                    return Err(IpcError::InvalidTarget { handle });
                }
                let entry = state.retire_handle(handle).ok_or(IpcError::InvalidTarget { handle })?;
                Ok(ServiceIdentity::new(handle, entry.token))
            }
            RegistryCommand::GrantAccess { task, handle } => {
                let identity = state.identity(handle)?;
                state
                    .tasks
                    .get_mut(&task)
                    .ok_or(IpcError::InvalidTarget { handle })?
                    .access
                    .insert(handle);
                Ok(identity)
            }
        }
    }

    fn set_ipc_thread(&self) -> Result<TaskId> {
        let mut state = self.kernel().state.lock();
        state.enter(self.task.id, true)?;
        state.require_registry()?;
        let task = state.task_mut(self.task.id)?;
        if task.ipc_thread {
            return Err(IpcError::IpcThreadAlreadySet);
        }
        task.ipc_thread = true;
        Ok(self.task.id)
    }

    fn driver_version(&self) -> Result<DriverVersion> {
        self.kernel().state.lock().enter(self.task.id, true)?;
        Ok(DriverVersion::CURRENT)
    }

    fn close(&self) -> Result<()> {
        self.kernel().terminate(self.task.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{PAGE_SIZE, POOL_DEFAULT_SIZE};

    fn mapped(kernel: &SimKernel) -> SimTransport {
        let t = kernel.open_task().unwrap();
        t.map_pool(POOL_DEFAULT_SIZE).unwrap();
        t
    }

    fn with_registry() -> (SimKernel, SimTransport) {
        let kernel = SimKernel::with_config(
            &IpcConfig::default().with_call_timeout(Duration::from_millis(200)),
        );
        let cms = mapped(&kernel);
        cms.set_as_registry(4096).unwrap();
        (kernel, cms)
    }

    #[test]
    fn pool_is_mapped_once() {
        let kernel = SimKernel::new();
        let t = kernel.open_task().unwrap();
        assert_eq!(t.map_pool(100), Err(IpcError::InvalidSize { size: 100 }));
        t.map_pool(POOL_DEFAULT_SIZE).unwrap();
        assert_eq!(t.map_pool(POOL_DEFAULT_SIZE), Err(IpcError::AlreadyMapped));
        assert_eq!(kernel.pool_usage(t.task_id()), Some((0, POOL_DEFAULT_SIZE)));
    }

    #[test]
    fn requests_need_mapped_pool_and_registry() {
        let kernel = SimKernel::new();
        let t = kernel.open_task().unwrap();
        assert_eq!(t.driver_version(), Err(IpcError::PoolNotMapped));
        t.map_pool(POOL_DEFAULT_SIZE).unwrap();
        assert_eq!(t.driver_version(), Ok(DriverVersion::CURRENT));
        assert_eq!(t.set_ipc_thread(), Err(IpcError::NoRegistry));
        let msg = Message::oneway(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
        assert_eq!(t.call(IpcFlags::SEND, Some(msg), None), Err(IpcError::NoRegistry));
    }

    #[test]
    fn single_registry() {
        let (kernel, cms) = with_registry();
        let other = mapped(&kernel);
        assert_eq!(other.set_as_registry(4096), Err(IpcError::AlreadyElected));
        assert_eq!(
            other.registry_command(RegistryCommand::GenerateHandle { task: other.task_id() }),
            Err(IpcError::NotElected)
        );
        assert_eq!(kernel.registry_task(), Some(cms.task_id()));
        assert_eq!(cms.set_ipc_thread(), Ok(cms.task_id()));
        assert_eq!(cms.set_ipc_thread(), Err(IpcError::IpcThreadAlreadySet));
    }

    #[test]
    fn concurrent_election_has_one_winner() {
        let kernel = SimKernel::new();
        let racers: Vec<_> = (0..6)
            .map(|_| {
                let t = mapped(&kernel);
                std::thread::spawn(move || t.set_as_registry(4096))
            })
            .collect();
        let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| *err == IpcError::AlreadyElected));
    }

    #[test]
    fn cloned_handles_share_one_mapping() {
        let kernel = SimKernel::new();
        let t = mapped(&kernel);
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let clone = t.clone();
                std::thread::spawn(move || clone.map_pool(2 * POOL_DEFAULT_SIZE))
            })
            .collect();
        for racer in racers {
            assert_eq!(racer.join().unwrap(), Err(IpcError::AlreadyMapped));
        }
        assert_eq!(kernel.pool_usage(t.task_id()), Some((0, POOL_DEFAULT_SIZE)));
    }

    #[test]
    fn registry_message_size_floor() {
        let kernel = SimKernel::new();
        let t = mapped(&kernel);
        assert_eq!(t.set_as_registry(8), Err(IpcError::InvalidSize { size: 8 }));
    }

    #[test]
    fn generated_handle_needs_grant() {
        let (kernel, cms) = with_registry();
        let server = mapped(&kernel);
        let client = mapped(&kernel);
        let id = cms
            .registry_command(RegistryCommand::GenerateHandle { task: server.task_id() })
            .unwrap();
        assert!(kernel.has_access(cms.task_id(), id.handle));
        assert!(!kernel.has_access(client.task_id(), id.handle));

        let msg = Message::oneway(id, 7, Vec::new()).unwrap();
        assert_eq!(
            client.call(IpcFlags::SEND, Some(msg.clone()), None),
            Err(IpcError::AccessDenied { handle: id.handle })
        );
        cms.registry_command(RegistryCommand::GrantAccess {
            task: client.task_id(),
            handle: id.handle,
        })
        .unwrap();
        assert_eq!(client.call(IpcFlags::SEND, Some(msg), None), Ok(None));
        assert_eq!(kernel.queued(server.task_id()), 1);
    }

    #[test]
    fn stale_token_is_invalid_target() {
        let (kernel, cms) = with_registry();
        let server = mapped(&kernel);
        let id = cms
            .registry_command(RegistryCommand::GenerateHandle { task: server.task_id() })
            .unwrap();
        let forged = ServiceIdentity::new(id.handle, id.token + 100);
        let msg = Message::oneway(forged, 1, Vec::new()).unwrap();
        assert_eq!(
            cms.call(IpcFlags::SEND, Some(msg), None),
            Err(IpcError::InvalidTarget { handle: id.handle })
        );
        cms.registry_command(RegistryCommand::RemoveHandle { handle: id.handle }).unwrap();
        assert_eq!(
            cms.registry_command(RegistryCommand::RemoveHandle { handle: id.handle }),
            Err(IpcError::InvalidTarget { handle: id.handle })
        );
    }

    #[test]
    fn call_without_reply_times_out() {
        let (kernel, cms) = with_registry();
        let client = mapped(&kernel);
        let msg = Message::request(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
        let started = Instant::now();
        assert_eq!(
            client.call(IpcFlags::CALL, Some(msg), None),
            Err(IpcError::TimedOut { timeout_ms: 200 })
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(kernel.queued(cms.task_id()), 1);
    }

    #[test]
    fn timed_out_waits_leave_no_waiter() {
        let (kernel, _cms) = with_registry();
        let client = mapped(&kernel);
        for _ in 0..3 {
            let msg = Message::request(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
            assert!(matches!(
                client.call(IpcFlags::CALL, Some(msg), None),
                Err(IpcError::TimedOut { .. })
            ));
        }
        let state = kernel.kernel.state.lock();
        let task = &state.tasks[&client.task_id()];
        assert!(task.waiters.is_empty());
        assert!(task.pending.is_empty());
    }

    #[test]
    fn replies_reach_their_own_call() {
        let (kernel, cms) = with_registry();
        let client = mapped(&kernel);
        let callers: Vec<_> = [b"a", b"b"]
            .into_iter()
            .map(|tag| {
                let client = client.clone();
                thread::spawn(move || {
                    let msg = Message::request(ServiceIdentity::CMS, 1, tag.to_vec()).unwrap();
                    client.call(IpcFlags::CALL, Some(msg), None).unwrap().unwrap()
                })
            })
            .collect();

        let first = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        let second = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        // Answer in the opposite order
        for req in [second, first] {
            let reply = Message::reply_to(&req, req.payload().to_ascii_uppercase()).unwrap();
            cms.call(IpcFlags::REPLY, Some(reply), req.buffer()).unwrap();
        }

        let got: Vec<Vec<u8>> = callers
            .into_iter()
            .map(|c| c.join().unwrap().payload().to_vec())
            .collect();
        assert_eq!(got, vec![b"A".to_vec(), b"B".to_vec()]);
        assert!(kernel.kernel.state.lock().tasks[&client.task_id()].pending.is_empty());
    }

    #[test]
    fn receiving_thread_leaves_replies_alone() {
        let (kernel, cms) = with_registry();
        let task = mapped(&kernel);
        let inbox = cms
            .registry_command(RegistryCommand::GenerateHandle { task: task.task_id() })
            .unwrap();
        let receiver = {
            let task = task.clone();
            thread::spawn(move || task.call(IpcFlags::RECEIVE, None, None))
        };
        let caller = {
            let task = task.clone();
            thread::spawn(move || {
                let msg = Message::request(ServiceIdentity::CMS, 1, b"out".to_vec()).unwrap();
                task.call(IpcFlags::CALL, Some(msg), None)
            })
        };

        let req = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        let reply = Message::reply_to(&req, b"back".to_vec()).unwrap();
        cms.call(IpcFlags::REPLY, Some(reply), req.buffer()).unwrap();
        assert_eq!(caller.join().unwrap().unwrap().unwrap().payload(), b"back");

        let wake = Message::oneway(inbox, 5, Vec::new()).unwrap();
        cms.call(IpcFlags::SEND, Some(wake), None).unwrap();
        assert_eq!(receiver.join().unwrap().unwrap().unwrap().code(), 5);
    }

    #[test]
    fn rejected_reply_keeps_the_request() {
        let (kernel, cms) = with_registry();
        let client = kernel.open_task().unwrap();
        client.map_pool(PAGE_SIZE).unwrap();
        let inbox = cms
            .registry_command(RegistryCommand::GenerateHandle { task: client.task_id() })
            .unwrap();
        let filler = Message::oneway(inbox, 1, vec![0u8; 1000]).unwrap();
        let err = loop {
            if let Err(err) = cms.call(IpcFlags::SEND, Some(filler.clone()), None) {
                break err;
            }
        };
        assert!(matches!(err, IpcError::PoolExhausted { .. }));

        let caller = {
            let client = client.clone();
            thread::spawn(move || {
                let msg = Message::request(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
                client.call(IpcFlags::CALL, Some(msg), None)
            })
        };
        let req = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        let token = req.buffer().unwrap();
        let big = Message::reply_to(&req, vec![0u8; 1000]).unwrap();
        assert!(matches!(
            cms.call(IpcFlags::REPLY, Some(big), Some(token)),
            Err(IpcError::PoolExhausted { .. })
        ));
        assert!(kernel.pool_usage(cms.task_id()).unwrap().0 > 0);

        let failed = Message::failed_reply_to(&req, 9).unwrap();
        cms.call(IpcFlags::REPLY, Some(failed), Some(token)).unwrap();
        assert_eq!(kernel.pool_usage(cms.task_id()).unwrap().0, 0);
        assert_eq!(caller.join().unwrap(), Err(IpcError::RemoteFailure { status: 9 }));
    }

    #[test]
    fn flag_combinations_are_checked() {
        let (_kernel, cms) = with_registry();
        let req = Message::request(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
        assert!(matches!(
            cms.call(IpcFlags::SEND, Some(req), None),
            Err(IpcError::InvalidMessage(_))
        ));
        assert_eq!(cms.call(IpcFlags::FREE_BUFFER, None, None), Err(IpcError::InvalidBuffer));
        assert!(matches!(cms.call(IpcFlags::SEND, None, None), Err(IpcError::InvalidMessage(_))));
    }

    #[test]
    fn cms_message_ceiling() {
        let kernel = SimKernel::new();
        let cms = mapped(&kernel);
        cms.set_as_registry(MSG_HEADER_SIZE + 16).unwrap();
        let client = mapped(&kernel);
        let fits = Message::oneway(ServiceIdentity::CMS, 1, vec![0u8; 16]).unwrap();
        assert_eq!(client.call(IpcFlags::SEND, Some(fits), None), Ok(None));
        let big = Message::oneway(ServiceIdentity::CMS, 1, vec![0u8; 17]).unwrap();
        assert_eq!(
            client.call(IpcFlags::SEND, Some(big), None),
            Err(IpcError::PayloadTooLarge {
                size: MSG_HEADER_SIZE + 17,
                max: MSG_HEADER_SIZE + 16
            })
        );
    }

    #[test]
    fn unknown_fd_rolls_back_earlier_objects() {
        let (kernel, cms) = with_registry();
        let client = mapped(&kernel);
        let fd = kernel.install_fd(client.task_id()).unwrap();
        let msg = Message::oneway(ServiceIdentity::CMS, 1, Vec::new())
            .unwrap()
            .with_special_objects(vec![SpecialObject::Fd(fd), SpecialObject::Fd(999)])
            .unwrap();
        assert!(matches!(
            client.call(IpcFlags::SEND, Some(msg), None),
            Err(IpcError::InvalidMessage(_))
        ));
        assert_eq!(kernel.queued(cms.task_id()), 0);
        assert!(!kernel.fd_exists(cms.task_id(), fd + 1));
    }

    #[test]
    fn receive_and_free() {
        let (kernel, cms) = with_registry();
        let client = mapped(&kernel);
        let msg = Message::oneway(ServiceIdentity::CMS, 3, b"hi".to_vec()).unwrap();
        client.call(IpcFlags::SEND, Some(msg), None).unwrap();
        let got = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        assert_eq!(got.payload(), b"hi");
        assert_eq!(got.sender().map(|s| s.task_id), Some(client.task_id()));
        let token = got.buffer().unwrap();
        assert!(kernel.pool_usage(cms.task_id()).unwrap().0 > 0);
        assert_eq!(cms.call(IpcFlags::FREE_BUFFER, None, Some(token)), Ok(None));
        assert_eq!(kernel.pool_usage(cms.task_id()).unwrap().0, 0);
        assert_eq!(
            cms.call(IpcFlags::FREE_BUFFER, None, Some(token)),
            Err(IpcError::BufferAlreadyFreed)
        );
    }

    #[cfg(feature = "security")]
    #[test]
    fn sender_credentials_are_stamped() {
        let (kernel, cms) = with_registry();
        let client = mapped(&kernel);
        let creds = Credentials { uid: 1000, gid: 100 };
        kernel.set_credentials(client.task_id(), creds).unwrap();
        let msg = Message::oneway(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
        client.call(IpcFlags::SEND, Some(msg), None).unwrap();
        let got = cms.call(IpcFlags::RECEIVE, None, None).unwrap().unwrap();
        assert_eq!(got.credentials(), creds);
    }

    #[test]
    fn closed_task_is_unavailable() {
        let kernel = SimKernel::new();
        let t = kernel.open_task().unwrap();
        let id = t.task_id();
        t.close().unwrap();
        assert!(!kernel.is_alive(id));
        assert!(matches!(t.map_pool(POOL_DEFAULT_SIZE), Err(IpcError::DeviceUnavailable(_))));
        kernel.shutdown();
        assert!(matches!(kernel.open_task(), Err(IpcError::DeviceUnavailable(_))));
    }
}
