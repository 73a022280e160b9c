//! Client call library
//!
//! [`IpcClient`] wraps a [`Transport`] with the calling conventions every
//! LiteIPC task follows: map the pool once, check size ceilings before
//! touching the driver, free every received buffer exactly once, and talk to
//! the registry at handle 0 to publish or resolve service names.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::ipc::message::{Message, MessageKind, ServiceIdentity, SpecialObject};
use crate::ipc::transport::{IpcFlags, Transport};
use crate::servers::{self, CmsCode, RegistryStatus};
use crate::types::TaskId;

/// What a serve loop handler wants done with a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Answer with this payload
    Reply(Vec<u8>),
    /// Answer with a failed reply carrying this status
    Fail(u32),
    /// Answer with an empty reply if one is expected, then leave the loop
    Stop,
}

/// Per-task IPC client
pub struct IpcClient<T: Transport> {
    transport: T,
    config: IpcConfig,
    mapped: AtomicBool,
}

impl<T: Transport> IpcClient<T> {
    pub fn new(transport: T, config: IpcConfig) -> Self {
        Self {
            transport,
            config,
            mapped: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn task_id(&self) -> TaskId {
        self.transport.task_id()
    }

    /// Map the pool with the configured size unless already mapped
    pub fn ensure_mapped(&self) -> Result<()> {
        if self.mapped.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.transport.map_pool(self.config.pool_size) {
            Ok(()) | Err(IpcError::AlreadyMapped) => {
                self.mapped.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Publish this task as the service `name`
    pub fn register_service(&self, name: &str) -> Result<ServiceIdentity> {
        let name = servers::service_name(name)?;
        let id = self.call_registry(CmsCode::Register, servers::encode_name(&name))?;
        debug!(target: "liteipc::client", "registered {name} as handle {}", id.handle);
        Ok(id)
    }

    /// Resolve `name` and gain access to it
    pub fn lookup_service(&self, name: &str) -> Result<ServiceIdentity> {
        let name = servers::service_name(name)?;
        self.call_registry(CmsCode::Get, servers::encode_name(&name))
    }

    /// Withdraw a service this task registered
    pub fn unregister_service(&self, identity: ServiceIdentity) -> Result<()> {
        self.call_registry(CmsCode::Unregister, servers::encode_handle(identity.handle))?;
        Ok(())
    }

    /// Ask the registry loop to exit
    pub fn stop_registry(&self) -> Result<()> {
        self.send_oneway(ServiceIdentity::CMS, CmsCode::Stop as u32, Vec::new())
    }

    fn call_registry(&self, code: CmsCode, payload: Vec<u8>) -> Result<ServiceIdentity> {
        match self.call(ServiceIdentity::CMS, code as u32, payload, Vec::new()) {
            Ok(reply) => {
                let decoded = servers::decode_identity(reply.payload());
                self.free(&reply)?;
                decoded
            }
            Err(IpcError::RemoteFailure { status }) => Err(RegistryStatus::to_error(status)),
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Blocking request/reply; free the returned reply with [`free`](Self::free)
    pub fn call(
        &self,
        target: ServiceIdentity,
        code: u32,
        payload: impl Into<Vec<u8>>,
        special_objects: Vec<SpecialObject>,
    ) -> Result<Message> {
        let msg = Message::request(target, code, payload)?.with_special_objects(special_objects)?;
        self.ensure_mapped()?;
        self.transport
            .call(IpcFlags::CALL, Some(msg), None)?
            .ok_or_else(|| IpcError::invalid("call returned without a reply"))
    }

    /// Blocking request/reply returning the reply payload
    pub fn call_owned(&self, target: ServiceIdentity, code: u32, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let reply = self.call(target, code, payload, Vec::new())?;
        let bytes = reply.payload().to_vec();
        self.free(&reply)?;
        Ok(bytes)
    }

    /// Fire-and-forget request
    pub fn send_oneway(&self, target: ServiceIdentity, code: u32, payload: impl Into<Vec<u8>>) -> Result<()> {
        let msg = Message::oneway(target, code, payload)?;
        self.ensure_mapped()?;
        self.transport.call(IpcFlags::SEND, Some(msg), None)?;
        Ok(())
    }

    /// Answer `request` and release its buffer
    pub fn reply(&self, request: &Message, payload: impl Into<Vec<u8>>) -> Result<()> {
        let reply = Message::reply_to(request, payload)?;
        self.answer(request, reply)
    }

    /// Answer `request` with a failure status and release its buffer
    pub fn fail_reply(&self, request: &Message, status: u32) -> Result<()> {
        let reply = Message::failed_reply_to(request, status)?;
        self.answer(request, reply)
    }

    fn answer(&self, request: &Message, reply: Message) -> Result<()> {
        let token = request.buffer().ok_or(IpcError::InvalidBuffer)?;
        self.transport.call(IpcFlags::REPLY, Some(reply), Some(token))?;
        Ok(())
    }

    /// Block for the next request or death notification
    pub fn receive(&self) -> Result<Message> {
        self.ensure_mapped()?;
        self.transport
            .call(IpcFlags::RECEIVE, None, None)?
            .ok_or_else(|| IpcError::invalid("receive returned no message"))
    }

    /// Release a received message's buffer
    pub fn free(&self, msg: &Message) -> Result<()> {
        let token = msg.buffer().ok_or(IpcError::InvalidBuffer)?;
        self.transport.call(IpcFlags::FREE_BUFFER, None, Some(token))?;
        Ok(())
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Receive and dispatch messages until the handler returns [`Outcome::Stop`]
    ///
    /// Requests expecting an answer get one; one-way requests and death
    /// notifications are only freed, whatever the handler returns.
    pub fn serve_loop<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(&Message) -> Outcome,
    {
        loop {
            let msg = self.receive()?;
            let outcome = handler(&msg);
            let answerable = msg.kind() == MessageKind::Request && !msg.is_oneway();
            let stop = outcome == Outcome::Stop;
            let sent = match (answerable, outcome) {
                (true, Outcome::Reply(payload)) => self.reply(&msg, payload),
                (true, Outcome::Fail(status)) => self.fail_reply(&msg, status),
                (true, Outcome::Stop) => self.reply(&msg, Vec::new()),
                (false, _) => self.free(&msg),
            };
            if let Err(err) = sent {
                warn!(target: "liteipc::client", "{}: answering code {} failed: {err}", self.task_id(), msg.code());
                if answerable {
                    if let Err(err) = self.free(&msg) {
                        debug!(target: "liteipc::client", "free after failed answer: {err}");
                    }
                }
            }
            if stop {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::sim::SimKernel;
    use crate::ipc::{MAX_PAYLOAD_SIZE, MAX_SPECIAL_OBJECTS};

    #[test]
    fn ceilings_are_checked_before_the_transport() {
        let kernel = SimKernel::new();
        let client = IpcClient::new(kernel.open_task().unwrap(), IpcConfig::default());
        let id = client.task_id();

        let err = client.call(ServiceIdentity::CMS, 1, vec![0u8; MAX_PAYLOAD_SIZE + 1], Vec::new());
        assert!(matches!(err, Err(IpcError::PayloadTooLarge { .. })));
        let objects = vec![SpecialObject::Fd(0); MAX_SPECIAL_OBJECTS + 1];
        let err = client.call(ServiceIdentity::CMS, 1, Vec::new(), objects);
        assert!(matches!(err, Err(IpcError::TooManySpecialObjects { .. })));
        assert_eq!(kernel.transport_calls(id), 0);
    }

    #[test]
    fn mapping_happens_once() {
        let kernel = SimKernel::new();
        let client = IpcClient::new(kernel.open_task().unwrap(), IpcConfig::default());
        client.ensure_mapped().unwrap();
        client.ensure_mapped().unwrap();
        assert_eq!(kernel.transport_calls(client.task_id()), 1);
    }

    #[test]
    fn pool_mapped_elsewhere_counts_as_mapped() {
        let kernel = SimKernel::new();
        let transport = kernel.open_task().unwrap();
        transport.map_pool(IpcConfig::default().pool_size).unwrap();
        let client = IpcClient::new(transport, IpcConfig::default());
        assert_eq!(client.ensure_mapped(), Ok(()));
    }

    #[test]
    fn bad_names_never_reach_the_registry() {
        let kernel = SimKernel::new();
        let client = IpcClient::new(kernel.open_task().unwrap(), IpcConfig::default());
        assert!(matches!(client.register_service(""), Err(IpcError::InvalidMessage(_))));
        let long = "n".repeat(crate::ipc::NAME_LEN_MAX + 1);
        assert!(matches!(client.lookup_service(&long), Err(IpcError::InvalidMessage(_))));
        assert_eq!(kernel.transport_calls(client.task_id()), 0);
    }

    #[test]
    fn free_needs_a_received_message() {
        let kernel = SimKernel::new();
        let client = IpcClient::new(kernel.open_task().unwrap(), IpcConfig::default());
        let msg = Message::request(ServiceIdentity::CMS, 1, Vec::new()).unwrap();
        assert_eq!(client.free(&msg), Err(IpcError::InvalidBuffer));
    }
}
