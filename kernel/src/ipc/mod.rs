//! IPC: a fixed-size message format exchanged between holders of a matching
//! `IpcEndpoint` capability, plus the endpoint registry itself.
//!
//! Core-0 keeps this deliberately small: one message shape, one capability
//! kind gating delivery, and a registry of endpoints keyed by a small
//! integer id. Large zero-copy transfers and async channels are userspace
//! concerns layered on Core-3, not this core.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cap::{self, CapabilityKind, DomainId, Handle, Permissions};
use crate::error::KernelError;

/// Maximum payload carried by a single message, per the wire format.
pub const MAX_DATA_SIZE: usize = 4096;

pub type EndpointId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub msg_id: u64,
    pub src_service: DomainId,
    pub dst_service: DomainId,
    pub data_size: u32,
    pub flags: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(header: MessageHeader, data: &[u8]) -> Result<Self, KernelError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(KernelError::InvalidArgument { name: "ipc message data_size" });
        }
        Ok(Self {
            header,
            data: data.to_vec(),
        })
    }
}

struct Endpoint {
    owner: DomainId,
    cap: Handle,
    inbox: Vec<Message>,
}

pub struct IpcRegistry {
    endpoints: BTreeMap<EndpointId, Endpoint>,
    next_id: EndpointId,
}

impl IpcRegistry {
    pub const fn new() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register a new endpoint owned by `domain`, minting the `IpcEndpoint`
    /// capability that gates delivery to it. Carries `GRANT` so the owner can
    /// hand write access to another domain's callers via `cap::grant`.
    pub fn register(&mut self, domain: DomainId) -> Result<(EndpointId, Handle), KernelError> {
        let cap = cap::create(
            CapabilityKind::IpcEndpoint,
            Permissions::READ | Permissions::WRITE | Permissions::GRANT,
            0,
            0,
            0,
            domain,
        )?;
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(KernelError::InvalidArgument { name: "endpoint id space exhausted" })?;
        self.endpoints.insert(
            id,
            Endpoint {
                owner: domain,
                cap,
                inbox: Vec::new(),
            },
        );
        Ok((id, cap))
    }

    pub fn unregister(&mut self, endpoint: EndpointId) -> Result<(), KernelError> {
        let ep = self
            .endpoints
            .remove(&endpoint)
            .ok_or(KernelError::InvalidArgument { name: "unknown endpoint" })?;
        let _ = cap::delete(ep.cap);
        Ok(())
    }

    /// Deliver `msg` to `endpoint`, provided `caller` presents a capability
    /// that still checks out for write access to the endpoint's `IpcEndpoint`
    /// capability (the capability is shared by grant, not duplicated).
    pub fn call(
        &mut self,
        endpoint: EndpointId,
        caller: DomainId,
        presented: Handle,
        msg: Message,
    ) -> Result<(), KernelError> {
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(KernelError::InvalidArgument { name: "unknown endpoint" })?;
        if presented != ep.cap {
            return Err(KernelError::InvalidArgument { name: "wrong endpoint capability" });
        }
        cap::check(caller, presented, Permissions::WRITE)?;
        ep.inbox.push(msg);
        Ok(())
    }

    /// Non-blocking receive: pop the oldest pending message for `endpoint`,
    /// provided `domain` is its owner. Blocking receive-with-timeout is
    /// layered on top by the scheduler (`sleep` + retry), not modeled here.
    pub fn wait(&mut self, endpoint: EndpointId, domain: DomainId) -> Result<Option<Message>, KernelError> {
        let ep = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(KernelError::InvalidArgument { name: "unknown endpoint" })?;
        if ep.owner != domain {
            return Err(KernelError::InvalidArgument { name: "not endpoint owner" });
        }
        if ep.inbox.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ep.inbox.remove(0)))
        }
    }
}

impl Default for IpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Mutex<IpcRegistry> = Mutex::new(IpcRegistry::new());

pub fn register(domain: DomainId) -> Result<(EndpointId, Handle), KernelError> {
    REGISTRY.lock().register(domain)
}

pub fn unregister(endpoint: EndpointId) -> Result<(), KernelError> {
    REGISTRY.lock().unregister(endpoint)
}

pub fn call(endpoint: EndpointId, caller: DomainId, presented: Handle, msg: Message) -> Result<(), KernelError> {
    REGISTRY.lock().call(endpoint, caller, presented, msg)
}

pub fn wait(endpoint: EndpointId, domain: DomainId) -> Result<Option<Message>, KernelError> {
    REGISTRY.lock().wait(endpoint, domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(dst: DomainId) -> MessageHeader {
        MessageHeader {
            msg_type: MessageType::Request,
            msg_id: 1,
            src_service: 0,
            dst_service: dst,
            data_size: 0,
            flags: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn register_call_wait_roundtrip() {
        let mut reg = IpcRegistry::new();
        let owner = cap::create_domain(0, 0);
        let caller = cap::create_domain(0, 0);
        let (ep, cap_handle) = reg.register(owner).unwrap();
        // A caller outside the owning domain must first be granted the
        // endpoint's governing capability -- presenting the bare handle
        // without it in your own handle space is exactly what `check`
        // rejects.
        cap::grant(cap_handle, caller).unwrap();

        let msg = Message::new(header(owner), b"hello").unwrap();
        reg.call(ep, caller, cap_handle, msg).unwrap();

        let received = reg.wait(ep, owner).unwrap().unwrap();
        assert_eq!(received.data, b"hello");
        assert!(reg.wait(ep, owner).unwrap().is_none());
    }

    #[test]
    fn call_rejects_wrong_capability() {
        let mut reg = IpcRegistry::new();
        let owner = cap::create_domain(0, 0);
        let caller = cap::create_domain(0, 0);
        let (ep, _cap_handle) = reg.register(owner).unwrap();
        let forged = cap::create(CapabilityKind::IpcEndpoint, Permissions::WRITE, 0, 0, 0, caller).unwrap();

        let msg = Message::new(header(owner), b"x").unwrap();
        assert!(reg.call(ep, caller, forged, msg).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let data = Vec::from([0u8; MAX_DATA_SIZE + 1]);
        assert!(Message::new(header(0), &data).is_err());
    }

    #[test]
    fn wait_requires_ownership() {
        let mut reg = IpcRegistry::new();
        let owner = cap::create_domain(0, 0);
        let other = cap::create_domain(0, 0);
        let (ep, _) = reg.register(owner).unwrap();
        assert!(reg.wait(ep, other).is_err());
    }
}
