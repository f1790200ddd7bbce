//! Service records and the table that manages their lifecycle: create,
//! start, stop, restart, and fault-bounded auto-restart.
//!
//! Split the same way the scheduler is: a plain, test-constructible value
//! type (`ServiceManager`) and the kernel-wide singleton the rest of the
//! kernel calls into through the free functions at the bottom.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::cap::{self, CapabilityKind, DomainId, DomainState, Handle, Permissions};
use crate::error::ServiceError;
use crate::mm::pmm::{self, FrameType};
use crate::mm::PhysAddr;
use crate::sched::{self, Priority, ThreadId};

pub type ServiceId = u32;

/// A fault may be auto-restarted at most this many times before the
/// service is left in `Error` until an operator manually restarts it.
const MAX_AUTO_RESTARTS: u32 = 3;

#[derive(Debug)]
pub struct Service {
    pub id: ServiceId,
    pub name: &'static str,
    pub domain: DomainId,
    pub state: DomainState,
    pub entry: extern "C" fn(u64) -> !,
    pub code_base: u64,
    pub code_size: u64,
    pub data_base: u64,
    pub data_size: u64,
    pub cap_handle: Handle,
    pub thread: Option<ThreadId>,
    pub restart_count: u32,
    pub last_error: u64,
}

pub struct ServiceManager {
    services: BTreeMap<ServiceId, Service>,
    next_id: ServiceId,
}

impl ServiceManager {
    pub const fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register a service image already resident at `code_base`/`data_base`
    /// (loading it there is out of scope; see PURPOSE & SCOPE). Mints the
    /// domain and the `Service` capability an operator needs to start it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        name: &'static str,
        entry: extern "C" fn(u64) -> !,
        code_base: u64,
        code_size: u64,
        data_base: u64,
        data_size: u64,
    ) -> Result<ServiceId, ServiceError> {
        let domain = cap::create_domain(code_base.min(data_base), code_size + data_size);
        let kernel_domain = cap::kernel_domain();

        // The image is already resident at code_base/data_base (loading it
        // there is out of scope); mark both regions owned by this domain so
        // the PMM never hands the same frames to another domain.
        pmm::reserve(PhysAddr::new(code_base), code_size, FrameType::Service, domain);
        pmm::reserve(PhysAddr::new(data_base), data_size, FrameType::Service, domain);

        let cap_handle = cap::create(
            CapabilityKind::Service,
            Permissions::READ | Permissions::WRITE | Permissions::EXECUTE | Permissions::GRANT,
            0,
            code_base,
            code_size + data_size,
            kernel_domain,
        )
        .map_err(|_| ServiceError::TableFull)?;

        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).ok_or(ServiceError::TableFull)?;
        self.services.insert(
            id,
            Service {
                id,
                name,
                domain,
                state: DomainState::Stopped,
                entry,
                code_base,
                code_size,
                data_base,
                data_size,
                cap_handle,
                thread: None,
                restart_count: 0,
                last_error: 0,
            },
        );
        Ok(id)
    }

    fn get(&self, id: ServiceId) -> Result<&Service, ServiceError> {
        self.services.get(&id).ok_or(ServiceError::UnknownService)
    }

    fn get_mut(&mut self, id: ServiceId) -> Result<&mut Service, ServiceError> {
        self.services.get_mut(&id).ok_or(ServiceError::UnknownService)
    }

    /// Create a thread running the service's entry point in its own domain
    /// and transition to `Running`. The only path that resets
    /// `restart_count` to zero -- `restart` preserves it, since the budget
    /// belongs to `handle_fault`, not to any particular restart call.
    pub fn start(&mut self, id: ServiceId) -> Result<(), ServiceError> {
        let svc = self.get_mut(id)?;
        if svc.state == DomainState::Running {
            return Err(ServiceError::WrongState);
        }
        let tid = sched::create_thread(svc.domain, svc.entry, 0, Priority::Normal)
            .map_err(|_| ServiceError::TableFull)?;
        svc.thread = Some(tid);
        svc.state = DomainState::Running;
        svc.restart_count = 0;
        let _ = cap::set_domain_state(svc.domain, DomainState::Running);
        Ok(())
    }

    pub fn stop(&mut self, id: ServiceId) -> Result<(), ServiceError> {
        let svc = self.get_mut(id)?;
        if let Some(tid) = svc.thread.take() {
            let _ = sched::terminate_thread(tid);
        }
        svc.state = DomainState::Stopped;
        let _ = cap::set_domain_state(svc.domain, DomainState::Stopped);
        Ok(())
    }

    /// Stop then start, preserving `restart_count` across the cycle.
    pub fn restart(&mut self, id: ServiceId) -> Result<(), ServiceError> {
        let saved = self.get(id)?.restart_count;
        self.stop(id)?;
        self.start(id)?;
        self.get_mut(id)?.restart_count = saved;
        Ok(())
    }

    pub fn terminate(&mut self, id: ServiceId) -> Result<(), ServiceError> {
        let svc = self.services.remove(&id).ok_or(ServiceError::UnknownService)?;
        if let Some(tid) = svc.thread {
            let _ = sched::terminate_thread(tid);
        }
        let _ = pmm::free(PhysAddr::new(svc.code_base));
        let _ = pmm::free(PhysAddr::new(svc.data_base));
        let _ = cap::destroy_domain(svc.domain);
        Ok(())
    }

    /// Record a fault, bump `restart_count`, and auto-restart while the
    /// budget allows. Past `MAX_AUTO_RESTARTS` the service is terminal --
    /// `Error`, not running -- until an operator calls `start` directly.
    pub fn handle_fault(&mut self, id: ServiceId, error_code: u64) -> Result<(), ServiceError> {
        {
            let svc = self.get_mut(id)?;
            svc.state = DomainState::Error;
            svc.last_error = error_code;
            svc.restart_count += 1;
            let _ = cap::set_domain_state(svc.domain, DomainState::Error);
        }
        if self.get(id)?.restart_count <= MAX_AUTO_RESTARTS {
            let saved = self.get(id)?.restart_count;
            self.stop(id)?;
            self.start(id)?;
            self.get_mut(id)?.restart_count = saved;
        }
        Ok(())
    }

    pub fn state(&self, id: ServiceId) -> Result<DomainState, ServiceError> {
        self.get(id).map(|s| s.state)
    }

    pub fn restart_count(&self, id: ServiceId) -> Result<u32, ServiceError> {
        self.get(id).map(|s| s.restart_count)
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

static SERVICES: Mutex<ServiceManager> = Mutex::new(ServiceManager::new());

#[allow(clippy::too_many_arguments)]
pub fn create(
    name: &'static str,
    entry: extern "C" fn(u64) -> !,
    code_base: u64,
    code_size: u64,
    data_base: u64,
    data_size: u64,
) -> Result<ServiceId, ServiceError> {
    SERVICES.lock().create(name, entry, code_base, code_size, data_base, data_size)
}

pub fn start(id: ServiceId) -> Result<(), ServiceError> {
    SERVICES.lock().start(id)
}

pub fn stop(id: ServiceId) -> Result<(), ServiceError> {
    SERVICES.lock().stop(id)
}

pub fn restart(id: ServiceId) -> Result<(), ServiceError> {
    SERVICES.lock().restart(id)
}

pub fn terminate(id: ServiceId) -> Result<(), ServiceError> {
    SERVICES.lock().terminate(id)
}

pub fn handle_fault(id: ServiceId, error_code: u64) -> Result<(), ServiceError> {
    SERVICES.lock().handle_fault(id, error_code)
}

pub fn state(id: ServiceId) -> Result<DomainState, ServiceError> {
    SERVICES.lock().state(id)
}

pub fn restart_count(id: ServiceId) -> Result<u32, ServiceError> {
    SERVICES.lock().restart_count(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy(_: u64) -> ! {
        loop {}
    }

    #[test]
    fn auto_restart_bound_e2e6_e10() {
        let mut mgr = ServiceManager::new();
        let id = mgr.create("net", dummy, 0x10_0000, 0x1000, 0x11_0000, 0x1000).unwrap();
        mgr.start(id).unwrap();

        mgr.handle_fault(id, 1).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 1);
        assert_eq!(mgr.state(id).unwrap(), DomainState::Running);

        mgr.handle_fault(id, 1).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 2);

        mgr.handle_fault(id, 1).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 3);
        assert_eq!(mgr.state(id).unwrap(), DomainState::Running);

        mgr.handle_fault(id, 1).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 4);
        assert_eq!(mgr.state(id).unwrap(), DomainState::Error);
    }

    #[test]
    fn manual_restart_does_not_bump_count() {
        let mut mgr = ServiceManager::new();
        let id = mgr.create("net", dummy, 0, 0x1000, 0x1000, 0x1000).unwrap();
        mgr.start(id).unwrap();
        mgr.handle_fault(id, 1).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 1);
        mgr.restart(id).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 1);
        assert_eq!(mgr.state(id).unwrap(), DomainState::Running);
    }

    #[test]
    fn manual_start_after_error_resets_restart_count() {
        let mut mgr = ServiceManager::new();
        let id = mgr.create("net", dummy, 0, 0x1000, 0x1000, 0x1000).unwrap();
        mgr.start(id).unwrap();
        for _ in 0..4 {
            mgr.handle_fault(id, 1).unwrap();
        }
        assert_eq!(mgr.state(id).unwrap(), DomainState::Error);

        mgr.start(id).unwrap();
        assert_eq!(mgr.restart_count(id).unwrap(), 0);
        assert_eq!(mgr.state(id).unwrap(), DomainState::Running);
    }

    #[test]
    fn terminate_removes_service_and_domain() {
        let mut mgr = ServiceManager::new();
        let id = mgr.create("net", dummy, 0, 0x1000, 0x1000, 0x1000).unwrap();
        let domain = mgr.get(id).unwrap().domain;
        mgr.terminate(id).unwrap();
        assert!(mgr.state(id).is_err());
        assert!(cap::domain_state(domain).is_err());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut mgr = ServiceManager::new();
        let id = mgr.create("net", dummy, 0, 0x1000, 0x1000, 0x1000).unwrap();
        mgr.start(id).unwrap();
        assert_eq!(mgr.start(id), Err(ServiceError::WrongState));
    }
}
