//! Component Management Service
//!
//! The CMS is the one elected registry. It owns the table mapping service
//! names to kernel handles, hands out handles on `Register`, grants access on
//! `Get`, and retires handles when their owner exits.
//!
//! The loop handles one message at a time and the name table is a private
//! field touched only from it; running the loop on several threads would
//! need a lock around the table.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

use super::{CmsCode, RegistryStatus, ServiceName};
use crate::client::{IpcClient, Outcome};
use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::ipc::message::{Message, Routing, ServiceIdentity};
use crate::ipc::transport::{RegistryCommand, Transport};
use crate::types::TaskId;

/// Lifecycle of the registry task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Elected,
    Running,
    Stopped,
}

/// One published service
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: ServiceName,
    pub identity: ServiceIdentity,
    pub owner: TaskId,
    /// Tasks granted access through `Get`
    pub access: BTreeSet<TaskId>,
}

/// Name table, keyed by handle
#[derive(Debug, Default)]
struct NameTable {
    entries: BTreeMap<u32, RegistryEntry>,
}

impl NameTable {
    fn find(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.values().find(|e| e.name.as_str() == name)
    }

    fn dispatch<T: Transport>(&mut self, transport: &T, msg: &Message) -> Outcome {
        match msg.routing() {
            Routing::DeathNotify { task, handle } => {
                self.forget(transport, task, handle);
                return Outcome::Reply(Vec::new());
            }
            Routing::Request(_) => {}
            Routing::Reply(_) | Routing::FailedReply(_) => {
                debug!(target: "liteipc::cms", "ignoring stray {:?}", msg.kind());
                return Outcome::Reply(Vec::new());
            }
        }
        let Some(requester) = msg.sender().map(|s| s.task_id) else {
            return Outcome::Fail(RegistryStatus::InvalidMessage as u32);
        };
        let result = match CmsCode::from_raw(msg.code()) {
            Some(CmsCode::Register) => self.register(transport, requester, msg.payload()),
            Some(CmsCode::Get) => self.get(transport, requester, msg.payload()),
            Some(CmsCode::Unregister) => self.unregister(transport, requester, msg.payload()),
            Some(CmsCode::Stop) if requester == transport.task_id() => {
                info!(target: "liteipc::cms", "stop requested by {requester}");
                return Outcome::Stop;
            }
            Some(CmsCode::Stop) => {
                warn!(target: "liteipc::cms", "refusing stop from {requester}");
                Err(IpcError::AccessDenied { handle: 0 })
            }
            None => Err(IpcError::invalid(format!("unknown registry code {}", msg.code()))),
        };
        match result {
            Ok(identity) => Outcome::Reply(super::encode_identity(identity)),
            Err(err) => {
                debug!(target: "liteipc::cms", "code {} from {requester} failed: {err}", msg.code());
                Outcome::Fail(RegistryStatus::from_error(&err) as u32)
            }
        }
    }

    fn register<T: Transport>(&mut self, transport: &T, requester: TaskId, payload: &[u8]) -> Result<ServiceIdentity> {
        let name = super::decode_name(payload)?;
        if self.find(&name).is_some() {
            return Err(IpcError::AlreadyRegistered);
        }
        let identity = transport.registry_command(RegistryCommand::GenerateHandle { task: requester })?;
        info!(target: "liteipc::cms", "{name} -> handle {} owned by {requester}", identity.handle);
        self.entries.insert(
            identity.handle,
            RegistryEntry {
                name,
                identity,
                owner: requester,
                access: BTreeSet::new(),
            },
        );
        Ok(identity)
    }

    fn get<T: Transport>(&mut self, transport: &T, requester: TaskId, payload: &[u8]) -> Result<ServiceIdentity> {
        let name = super::decode_name(payload)?;
        let handle = self.find(&name).ok_or(IpcError::NotFound)?.identity.handle;
        transport.registry_command(RegistryCommand::GrantAccess {
            task: requester,
            handle,
        })?;
        let entry = self.entries.get_mut(&handle).ok_or(IpcError::NotFound)?;
        entry.access.insert(requester);
        Ok(entry.identity)
    }

    fn unregister<T: Transport>(&mut self, transport: &T, requester: TaskId, payload: &[u8]) -> Result<ServiceIdentity> {
        let handle = super::decode_handle(payload)?;
        let entry = self.entries.get(&handle).ok_or(IpcError::NotFound)?;
        if entry.owner != requester {
            return Err(IpcError::AccessDenied { handle });
        }
        transport.registry_command(RegistryCommand::RemoveHandle { handle })?;
        let entry = self.entries.remove(&handle).ok_or(IpcError::NotFound)?;
        info!(target: "liteipc::cms", "{} withdrawn by {requester}", entry.name);
        Ok(entry.identity)
    }

    /// Drop the entry of an exited owner
    fn forget<T: Transport>(&mut self, transport: &T, task: TaskId, handle: u32) {
        let Some(entry) = self.entries.remove(&handle) else {
            return;
        };
        info!(target: "liteipc::cms", "{} died, removing {}", task, entry.name);
        if let Err(err) = transport.registry_command(RegistryCommand::RemoveHandle { handle }) {
            warn!(target: "liteipc::cms", "removing handle {handle}: {err}");
        }
    }
}

/// The registry task
pub struct Registry<T: Transport> {
    client: IpcClient<T>,
    state: RegistryState,
    table: NameTable,
}

impl<T: Transport> Registry<T> {
    pub fn new(transport: T, config: IpcConfig) -> Self {
        Self {
            client: IpcClient::new(transport, config),
            state: RegistryState::Uninitialized,
            table: NameTable::default(),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn client(&self) -> &IpcClient<T> {
        &self.client
    }

    /// Claim the registry role
    pub fn elect(&mut self) -> Result<()> {
        if self.state != RegistryState::Uninitialized {
            return Err(IpcError::AlreadyElected);
        }
        self.client.ensure_mapped()?;
        let max = self.client.config().cms_max_message_size;
        self.client.transport().set_as_registry(max)?;
        self.state = RegistryState::Elected;
        info!(target: "liteipc::cms", "{} elected, max message {max} bytes", self.client.task_id());
        Ok(())
    }

    /// Serve until a `Stop` request; elects first if needed
    pub fn run(&mut self) -> Result<()> {
        if self.state == RegistryState::Uninitialized {
            self.elect()?;
        }
        if self.state != RegistryState::Elected {
            return Err(IpcError::invalid(format!("registry cannot run from {:?}", self.state)));
        }
        match self.client.transport().set_ipc_thread() {
            Ok(_) | Err(IpcError::IpcThreadAlreadySet) => {}
            Err(err) => return Err(err),
        }
        self.state = RegistryState::Running;

        let client = &self.client;
        let table = &mut self.table;
        let served = client.serve_loop(|msg| table.dispatch(client.transport(), msg));
        self.state = RegistryState::Stopped;
        info!(target: "liteipc::cms", "stopped with {} services", self.table.entries.len());
        served
    }

    /// Registered identity of `name`
    pub fn lookup(&self, name: &str) -> Option<ServiceIdentity> {
        self.table.find(name).map(|e| e.identity)
    }

    /// Snapshot of the table
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.table.entries.values().cloned().collect()
    }

    /// Handle one message without blocking; the message is not freed
    pub fn handle_message(&mut self, msg: &Message) -> Outcome {
        let outcome = self.table.dispatch(self.client.transport(), msg);
        if outcome == Outcome::Stop {
            self.state = RegistryState::Stopped;
        }
        outcome
    }
}

impl<T: Transport + Clone> Registry<T> {
    /// A client on the registry's own task; only it may stop the loop
    pub fn controller(&self) -> IpcClient<T> {
        IpcClient::new(self.client.transport().clone(), *self.client.config())
    }
}
