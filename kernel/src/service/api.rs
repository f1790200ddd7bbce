//! The Core-0 API handed to every service: the sole surface through which
//! service code touches kernel state. A trait object so a service doesn't
//! care whether it's talking to the real kernel or a test double; internal
//! kernel callers still go straight to `cap`/`sched`/`mm`/`isolation`/`ipc`,
//! never through this indirection.

use crate::cap::{DomainId, Handle, Permissions};
use crate::error::{KernelError, ServiceError};
use crate::ipc::{EndpointId, Message};
use crate::isolation::MapType;
use crate::mm::pmm::FrameType;
use crate::mm::{PhysAddr, VirtAddr};
use crate::sched::{Priority, ThreadId};

use super::ServiceId;

pub trait Core0Api {
    fn cap_grant(&self, handle: Handle, target: DomainId) -> Result<Handle, KernelError>;
    fn cap_revoke(&self, handle: Handle, domain: DomainId) -> Result<(), KernelError>;
    fn cap_check(&self, domain: DomainId, handle: Handle, required: Permissions) -> Result<(), KernelError>;

    fn thread_create(
        &self,
        domain: DomainId,
        entry: extern "C" fn(u64) -> !,
        arg: u64,
        priority: Priority,
    ) -> Result<ThreadId, KernelError>;
    fn thread_exit(&self, id: ThreadId) -> Result<(), KernelError>;
    fn thread_yield(&self);
    fn thread_sleep(&self, ticks: u64);

    fn mem_alloc(&self, size: u64, align: u64, owner: DomainId) -> PhysAddr;
    fn mem_free(&self, addr: PhysAddr) -> Result<(), KernelError>;
    #[allow(clippy::too_many_arguments)]
    fn mem_map(
        &self,
        domain: DomainId,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        map_type: MapType,
        cap: Handle,
    ) -> Result<(), KernelError>;
    fn mem_unmap(&self, domain: DomainId, va: VirtAddr, size: u64) -> Result<(), KernelError>;

    fn ipc_call(&self, endpoint: EndpointId, caller: DomainId, presented: Handle, msg: Message) -> Result<(), KernelError>;
    fn ipc_register(&self, domain: DomainId) -> Result<(EndpointId, Handle), KernelError>;
    fn ipc_unregister(&self, endpoint: EndpointId) -> Result<(), KernelError>;

    fn log(&self, message: &str);

    fn service_start(&self, id: ServiceId) -> Result<(), ServiceError>;
    fn service_stop(&self, id: ServiceId) -> Result<(), ServiceError>;
    fn service_restart(&self, id: ServiceId) -> Result<(), ServiceError>;
}

/// The real, kernel-backed implementation. Zero-sized: every method is a
/// direct call into the owning subsystem's already-locked singleton.
pub struct KernelApi;

impl Core0Api for KernelApi {
    fn cap_grant(&self, handle: Handle, target: DomainId) -> Result<Handle, KernelError> {
        Ok(crate::cap::grant(handle, target)?)
    }

    fn cap_revoke(&self, handle: Handle, domain: DomainId) -> Result<(), KernelError> {
        Ok(crate::cap::revoke(handle, domain)?)
    }

    fn cap_check(&self, domain: DomainId, handle: Handle, required: Permissions) -> Result<(), KernelError> {
        Ok(crate::cap::check(domain, handle, required)?)
    }

    fn thread_create(
        &self,
        domain: DomainId,
        entry: extern "C" fn(u64) -> !,
        arg: u64,
        priority: Priority,
    ) -> Result<ThreadId, KernelError> {
        Ok(crate::sched::create_thread(domain, entry, arg, priority)?)
    }

    fn thread_exit(&self, id: ThreadId) -> Result<(), KernelError> {
        Ok(crate::sched::terminate_thread(id)?)
    }

    fn thread_yield(&self) {
        crate::sched::yield_now();
    }

    fn thread_sleep(&self, ticks: u64) {
        crate::sched::sleep(ticks);
    }

    fn mem_alloc(&self, size: u64, align: u64, owner: DomainId) -> PhysAddr {
        crate::mm::pmm::alloc(size, align, FrameType::Service, owner)
    }

    fn mem_free(&self, addr: PhysAddr) -> Result<(), KernelError> {
        crate::mm::pmm::free(addr).map_err(|_| KernelError::InvalidArgument { name: "unknown allocation" })
    }

    fn mem_map(
        &self,
        domain: DomainId,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        map_type: MapType,
        cap: Handle,
    ) -> Result<(), KernelError> {
        Ok(crate::isolation::map(domain, va, pa, size, map_type, cap)?)
    }

    fn mem_unmap(&self, domain: DomainId, va: VirtAddr, size: u64) -> Result<(), KernelError> {
        Ok(crate::isolation::unmap(domain, va, size)?)
    }

    fn ipc_call(&self, endpoint: EndpointId, caller: DomainId, presented: Handle, msg: Message) -> Result<(), KernelError> {
        crate::ipc::call(endpoint, caller, presented, msg)
    }

    fn ipc_register(&self, domain: DomainId) -> Result<(EndpointId, Handle), KernelError> {
        crate::ipc::register(domain)
    }

    fn ipc_unregister(&self, endpoint: EndpointId) -> Result<(), KernelError> {
        crate::ipc::unregister(endpoint)
    }

    fn log(&self, message: &str) {
        log::info!("service: {message}");
    }

    fn service_start(&self, id: ServiceId) -> Result<(), ServiceError> {
        super::manager::start(id)
    }

    fn service_stop(&self, id: ServiceId) -> Result<(), ServiceError> {
        super::manager::stop(id)
    }

    fn service_restart(&self, id: ServiceId) -> Result<(), ServiceError> {
        super::manager::restart(id)
    }
}

static KERNEL_API: KernelApi = KernelApi;

/// Handed to every service at startup; the sole surface through which
/// service code touches kernel state.
pub fn api() -> &'static dyn Core0Api {
    &KERNEL_API
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{self, CapabilityKind};

    #[test]
    fn kernel_api_cap_check_round_trips_through_trait_object() {
        let handle_api: &dyn Core0Api = api();
        let domain = cap::create_domain(0, 0);
        let h = cap::create(CapabilityKind::Custom, Permissions::READ, 0, 0, 0, domain).unwrap();
        assert!(handle_api.cap_check(domain, h, Permissions::READ).is_ok());
        assert!(handle_api
            .cap_check(domain, h, Permissions::WRITE)
            .is_err());
    }
}
