//! The capability table and domain registry.
//!
//! `CapabilitySystem` is a plain value type so tests can build an isolated
//! instance instead of racing on kernel-wide global state; [`super`] wraps a
//! single instance behind a lock for the rest of the kernel to call into.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::CapError;

use super::types::{
    CapabilityKind, CapabilityRecord, DomainId, DomainState, Handle, Permissions,
    MAX_HANDLES_PER_DOMAIN,
};

/// A protection boundary: a physical region (for Core-1 services; zero-sized
/// for the kernel domain and for process domains whose backing is virtual),
/// and the ordered set of capability handles it currently holds.
pub struct Domain {
    pub id: DomainId,
    pub memory_base: u64,
    pub memory_size: u64,
    pub state: DomainState,
    handle_space: Vec<Handle>,
}

impl Domain {
    fn new(id: DomainId, memory_base: u64, memory_size: u64) -> Self {
        Self {
            id,
            memory_base,
            memory_size,
            state: DomainState::Stopped,
            handle_space: Vec::new(),
        }
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handle_space
    }
}

pub struct CapabilitySystem {
    capabilities: BTreeMap<Handle, CapabilityRecord>,
    domains: BTreeMap<DomainId, Domain>,
    next_handle: Handle,
    next_domain: DomainId,
}

impl CapabilitySystem {
    pub const fn new() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            domains: BTreeMap::new(),
            // Handle 0 is never issued, so a default-initialized or
            // zeroed handle field can never be mistaken for a live one.
            next_handle: 1,
            next_domain: 0,
        }
    }

    pub fn create_domain(&mut self, memory_base: u64, memory_size: u64) -> DomainId {
        let id = self.next_domain;
        self.next_domain += 1;
        self.domains.insert(id, Domain::new(id, memory_base, memory_size));
        id
    }

    pub fn domain(&self, domain: DomainId) -> Result<&Domain, CapError> {
        self.domains.get(&domain).ok_or(CapError::UnknownDomain)
    }

    pub fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<(), CapError> {
        let d = self.domains.get_mut(&domain).ok_or(CapError::UnknownDomain)?;
        d.state = state;
        Ok(())
    }

    /// Tear down a domain: capabilities it owns are deleted system-wide,
    /// capabilities merely granted to it are revoked from it alone.
    pub fn destroy_domain(&mut self, domain: DomainId) -> Result<(), CapError> {
        let handles = self
            .domains
            .get(&domain)
            .ok_or(CapError::UnknownDomain)?
            .handle_space
            .clone();
        for h in handles {
            let owner = self.capabilities.get(&h).map(|c| c.owner_domain);
            match owner {
                Some(owner) if owner == domain => {
                    let _ = self.delete(h);
                }
                Some(_) => {
                    let _ = self.revoke(h, domain);
                }
                None => {}
            }
        }
        self.domains.remove(&domain);
        Ok(())
    }

    fn alloc_handle(&mut self) -> Result<Handle, CapError> {
        let h = self.next_handle;
        self.next_handle = self.next_handle.checked_add(1).ok_or(CapError::TableFull)?;
        Ok(h)
    }

    fn insert_into_domain(&mut self, domain: DomainId, handle: Handle) -> Result<(), CapError> {
        let d = self.domains.get_mut(&domain).ok_or(CapError::UnknownDomain)?;
        if d.handle_space.len() >= MAX_HANDLES_PER_DOMAIN {
            return Err(CapError::HandleSpaceFull);
        }
        d.handle_space.push(handle);
        Ok(())
    }

    fn remove_from_domain(&mut self, domain: DomainId, handle: Handle) -> Result<(), CapError> {
        let d = self.domains.get_mut(&domain).ok_or(CapError::UnknownDomain)?;
        let before = d.handle_space.len();
        d.handle_space.retain(|&h| h != handle);
        if d.handle_space.len() == before {
            return Err(CapError::NoHandle);
        }
        Ok(())
    }

    pub fn create(
        &mut self,
        kind: CapabilityKind,
        perms: Permissions,
        resource_id: u64,
        base: u64,
        size: u64,
        domain: DomainId,
    ) -> Result<Handle, CapError> {
        if !self.domains.contains_key(&domain) {
            return Err(CapError::UnknownDomain);
        }
        let handle = self.alloc_handle()?;
        self.insert_into_domain(domain, handle)?;
        self.capabilities.insert(
            handle,
            CapabilityRecord {
                kind,
                perms,
                resource_id,
                base,
                size,
                owner_domain: domain,
                ref_count: 1,
            },
        );
        Ok(handle)
    }

    /// Remove `handle` from every domain that holds it and clear its slot.
    /// Once deleted, a handle never resurfaces.
    pub fn delete(&mut self, handle: Handle) -> Result<(), CapError> {
        if self.capabilities.remove(&handle).is_none() {
            return Err(CapError::NoHandle);
        }
        for d in self.domains.values_mut() {
            d.handle_space.retain(|&h| h != handle);
        }
        Ok(())
    }

    pub fn grant(&mut self, handle: Handle, target: DomainId) -> Result<Handle, CapError> {
        if !self.domains.contains_key(&target) {
            return Err(CapError::UnknownDomain);
        }
        let cap = self.capabilities.get_mut(&handle).ok_or(CapError::NoHandle)?;
        if !cap.perms.contains(Permissions::GRANT) {
            return Err(CapError::NotGrantable);
        }
        cap.ref_count += 1;
        self.insert_into_domain(target, handle)?;
        Ok(handle)
    }

    pub fn revoke(&mut self, handle: Handle, domain: DomainId) -> Result<(), CapError> {
        self.remove_from_domain(domain, handle)?;
        let cap = self.capabilities.get_mut(&handle).ok_or(CapError::NoHandle)?;
        cap.ref_count -= 1;
        if cap.ref_count == 0 {
            self.capabilities.remove(&handle);
        }
        Ok(())
    }

    pub fn check(
        &self,
        domain: DomainId,
        handle: Handle,
        required: Permissions,
    ) -> Result<(), CapError> {
        let d = self.domains.get(&domain).ok_or(CapError::UnknownDomain)?;
        if !d.handle_space.contains(&handle) {
            return Err(CapError::NoHandle);
        }
        let cap = self.capabilities.get(&handle).ok_or(CapError::NoHandle)?;
        if !cap.perms.contains(required) {
            return Err(CapError::InsufficientPermissions);
        }
        Ok(())
    }

    /// Create a fresh capability over the same resource as `handle`, with
    /// permissions attenuated to `perms AND new_perms`. Owned by the same
    /// domain as the source -- attenuation never crosses a domain boundary
    /// on its own; `grant` still mediates that.
    pub fn derive(&mut self, handle: Handle, new_perms: Permissions) -> Result<Handle, CapError> {
        let source = *self.capabilities.get(&handle).ok_or(CapError::NoHandle)?;
        let attenuated = source.perms & new_perms;
        self.create(
            source.kind,
            attenuated,
            source.resource_id,
            source.base,
            source.size,
            source.owner_domain,
        )
    }

    pub fn get(&self, handle: Handle) -> Result<&CapabilityRecord, CapError> {
        self.capabilities.get(&handle).ok_or(CapError::NoHandle)
    }
}

impl Default for CapabilitySystem {
    fn default() -> Self {
        Self::new()
    }
}
