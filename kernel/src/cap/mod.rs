//! Capability system: unforgeable handles, capability records, and the
//! domains that hold them.
//!
//! A single global lock protects the table and every domain's handle space
//! (see the lock-order rule in `sched`/`isolation`: capabilities -> isolation
//! -> PMM). No operation here may suspend while the lock is held -- every
//! method below runs to completion in a handful of map operations.

pub mod table;
pub mod types;

pub use table::{CapabilitySystem, Domain};
pub use types::{
    CapabilityKind, CapabilityRecord, DomainId, DomainState, Handle, Permissions,
    MAX_HANDLES_PER_DOMAIN,
};

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::CapError;

static CAPS: Mutex<CapabilitySystem> = Mutex::new(CapabilitySystem::new());
static KERNEL_DOMAIN: AtomicU32 = AtomicU32::new(0);

/// Create the kernel's own domain. Called once from `kernel_init`, after the
/// PMM is up and before isolation/scheduler/service/process bring-up, since
/// every later subsystem needs somewhere to root its own capabilities.
pub fn init() {
    let id = CAPS.lock().create_domain(0, 0);
    KERNEL_DOMAIN.store(id, Ordering::Release);
    log::info!("cap: kernel domain {id} created");
}

pub fn kernel_domain() -> DomainId {
    KERNEL_DOMAIN.load(Ordering::Acquire)
}

pub fn create_domain(memory_base: u64, memory_size: u64) -> DomainId {
    CAPS.lock().create_domain(memory_base, memory_size)
}

pub fn destroy_domain(domain: DomainId) -> Result<(), CapError> {
    CAPS.lock().destroy_domain(domain)
}

pub fn set_domain_state(domain: DomainId, state: DomainState) -> Result<(), CapError> {
    CAPS.lock().set_domain_state(domain, state)
}

pub fn domain_state(domain: DomainId) -> Result<DomainState, CapError> {
    CAPS.lock().domain(domain).map(|d| d.state)
}

pub fn create(
    kind: CapabilityKind,
    perms: Permissions,
    resource_id: u64,
    base: u64,
    size: u64,
    domain: DomainId,
) -> Result<Handle, CapError> {
    CAPS.lock().create(kind, perms, resource_id, base, size, domain)
}

pub fn delete(handle: Handle) -> Result<(), CapError> {
    CAPS.lock().delete(handle)
}

pub fn grant(handle: Handle, target_domain: DomainId) -> Result<Handle, CapError> {
    CAPS.lock().grant(handle, target_domain)
}

pub fn revoke(handle: Handle, domain: DomainId) -> Result<(), CapError> {
    CAPS.lock().revoke(handle, domain)
}

pub fn check(domain: DomainId, handle: Handle, required: Permissions) -> Result<(), CapError> {
    CAPS.lock().check(domain, handle, required)
}

pub fn derive(handle: Handle, new_perms: Permissions) -> Result<Handle, CapError> {
    CAPS.lock().derive(handle, new_perms)
}

pub fn record(handle: Handle) -> Result<CapabilityRecord, CapError> {
    CAPS.lock().get(handle).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_and_check_then_revoke_e2e2() {
        let mut caps = CapabilitySystem::new();
        let a = caps.create_domain(0, 0);
        let h = caps
            .create(
                CapabilityKind::Memory,
                Permissions::READ | Permissions::WRITE | Permissions::GRANT,
                0,
                0x1000,
                0x1000,
                a,
            )
            .unwrap();
        assert!(caps.check(a, h, Permissions::READ | Permissions::WRITE).is_ok());

        let b = caps.create_domain(0, 0);
        caps.grant(h, b).unwrap();
        assert!(caps.check(b, h, Permissions::WRITE).is_ok());

        caps.revoke(h, b).unwrap();
        assert_eq!(caps.check(b, h, Permissions::READ), Err(CapError::NoHandle));
        assert!(caps.check(a, h, Permissions::READ).is_ok());
    }

    #[test]
    fn derive_only_attenuates_e2e4() {
        let mut caps = CapabilitySystem::new();
        let a = caps.create_domain(0, 0);
        let h1 = caps
            .create(
                CapabilityKind::Memory,
                Permissions::READ | Permissions::WRITE | Permissions::EXECUTE | Permissions::GRANT,
                0,
                0,
                0x1000,
                a,
            )
            .unwrap();
        let h2 = caps.derive(h1, Permissions::READ).unwrap();
        assert_eq!(
            caps.check(a, h2, Permissions::WRITE),
            Err(CapError::InsufficientPermissions)
        );
        assert!(caps.check(a, h2, Permissions::READ).is_ok());
    }

    #[test]
    fn deleted_handle_never_resurfaces() {
        let mut caps = CapabilitySystem::new();
        let a = caps.create_domain(0, 0);
        let h = caps
            .create(CapabilityKind::Custom, Permissions::READ, 0, 0, 0, a)
            .unwrap();
        caps.delete(h).unwrap();
        assert_eq!(caps.check(a, h, Permissions::READ), Err(CapError::NoHandle));
        assert_eq!(caps.delete(h), Err(CapError::NoHandle));
    }

    #[test]
    fn handle_space_full_is_rejected() {
        let mut caps = CapabilitySystem::new();
        let a = caps.create_domain(0, 0);
        for _ in 0..MAX_HANDLES_PER_DOMAIN {
            caps.create(CapabilityKind::Custom, Permissions::READ, 0, 0, 0, a)
                .unwrap();
        }
        assert_eq!(
            caps.create(CapabilityKind::Custom, Permissions::READ, 0, 0, 0, a),
            Err(CapError::HandleSpaceFull)
        );
    }

    #[test]
    fn destroy_domain_deletes_owned_and_revokes_granted() {
        let mut caps = CapabilitySystem::new();
        let owner = caps.create_domain(0, 0);
        let other = caps.create_domain(0, 0);
        let owned = caps
            .create(CapabilityKind::Memory, Permissions::READ | Permissions::GRANT, 0, 0, 0, owner)
            .unwrap();
        caps.grant(owned, other).unwrap();

        caps.destroy_domain(owner).unwrap();
        assert_eq!(caps.check(other, owned, Permissions::READ), Err(CapError::NoHandle));
        assert_eq!(caps.domain(owner), Err(CapError::UnknownDomain));
    }

    #[test]
    fn ungrantable_capability_cannot_be_granted() {
        let mut caps = CapabilitySystem::new();
        let a = caps.create_domain(0, 0);
        let b = caps.create_domain(0, 0);
        let h = caps
            .create(CapabilityKind::Memory, Permissions::READ, 0, 0, 0, a)
            .unwrap();
        assert_eq!(caps.grant(h, b), Err(CapError::NotGrantable));
    }
}
