//! Service manager: lifecycle of Core-1 services -- dedicated domains with
//! fault-bounded auto-restart, built on capabilities, the scheduler, and
//! isolation the same way `process` builds Core-3 processes on the same
//! three subsystems.

pub mod api;
pub mod manager;

pub use api::{api, Core0Api, KernelApi};
pub use manager::{Service, ServiceId, ServiceManager};

use crate::cap::DomainState;
use crate::error::ServiceError;

pub fn init() {
    log::info!("service: manager ready");
}

#[allow(clippy::too_many_arguments)]
pub fn create(
    name: &'static str,
    entry: extern "C" fn(u64) -> !,
    code_base: u64,
    code_size: u64,
    data_base: u64,
    data_size: u64,
) -> Result<ServiceId, ServiceError> {
    manager::create(name, entry, code_base, code_size, data_base, data_size)
}

pub fn start(id: ServiceId) -> Result<(), ServiceError> {
    manager::start(id)
}

pub fn stop(id: ServiceId) -> Result<(), ServiceError> {
    manager::stop(id)
}

pub fn restart(id: ServiceId) -> Result<(), ServiceError> {
    manager::restart(id)
}

pub fn terminate(id: ServiceId) -> Result<(), ServiceError> {
    manager::terminate(id)
}

pub fn handle_fault(id: ServiceId, error_code: u64) -> Result<(), ServiceError> {
    manager::handle_fault(id, error_code)
}

pub fn state(id: ServiceId) -> Result<DomainState, ServiceError> {
    manager::state(id)
}

pub fn restart_count(id: ServiceId) -> Result<u32, ServiceError> {
    manager::restart_count(id)
}
