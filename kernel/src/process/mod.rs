//! Process manager: Core-3 user processes, each a domain with virtual
//! address space mappings for code, data, stack, and heap, built the same
//! way `service` builds Core-1 domains on capabilities, the scheduler, and
//! isolation.
//!
//! Loading an executable image from storage is out of scope for this core
//! (see PURPOSE & SCOPE); `create` instead takes a `ProcessImage` already
//! resolved to sizes and an entry point, the same way a service's `create`
//! takes an already-loaded `code_base`/`code_size`.

pub mod manager;

pub use manager::{Pid, Process, ProcessImage, ProcessManager, ProcessState};

use crate::error::{KernelError, ProcessError};

pub fn init() {
    log::info!("process: manager ready");
}

pub fn create(image: &ProcessImage, parent: Option<Pid>, argc: usize) -> Result<Pid, ProcessError> {
    manager::create(image, parent, argc)
}

pub fn exit(domain: crate::cap::DomainId, code: i32) -> Result<(), ProcessError> {
    manager::exit(domain, code)
}

pub fn state(pid: Pid) -> Result<ProcessState, ProcessError> {
    manager::state(pid)
}

pub fn pid_of_domain(domain: crate::cap::DomainId) -> Option<Pid> {
    manager::pid_of_domain(domain)
}

pub fn domain_of_pid(pid: Pid) -> Option<crate::cap::DomainId> {
    manager::domain_of_pid(pid)
}

pub fn parent_pid(pid: Pid) -> Option<Pid> {
    manager::parent_pid(pid)
}

/// Reserved in the external interface but not implemented by this core: an
/// address-space-duplicating `fork` needs page-table copy-on-write this
/// core's `PageTableArena` doesn't model.
pub fn fork(_parent: Pid) -> Result<Pid, KernelError> {
    Err(KernelError::NotImplemented { feature: "process::fork" })
}

/// Reserved in the external interface but not implemented by this core:
/// replacing a running process's image needs the same loader this core
/// deliberately doesn't have (see `ProcessImage`'s doc comment).
pub fn exec(_pid: Pid, _image: &ProcessImage) -> Result<(), KernelError> {
    Err(KernelError::NotImplemented { feature: "process::exec" })
}
