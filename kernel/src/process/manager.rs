//! Process records and the table that manages their lifecycle: create and
//! exit. Split the same way `service::manager` is: a plain,
//! test-constructible value type (`ProcessManager`) plus the kernel-wide
//! singleton the rest of the kernel calls into through the free functions
//! at the bottom.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::cap::{self, CapabilityKind, DomainId, Permissions};
use crate::error::ProcessError;
use crate::isolation::{self, addr, DomainFlags, MapType};
use crate::mm::pmm::{self, FrameType};
use crate::mm::{frames_for, PhysAddr, VirtAddr, FRAME_SIZE};
use crate::sched::{self, Priority, ThreadId};

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// A process image already resolved to physical sizes and an entry point.
/// Resolving a path on durable storage to one of these -- an ELF loader, a
/// filesystem -- is out of scope for this core (see PURPOSE & SCOPE); the
/// caller supplies it the same way a service's `create` takes an
/// already-loaded `code_base`/`code_size`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessImage {
    pub path: &'static str,
    pub entry_point: u64,
    pub code_size: u64,
    pub data_size: u64,
    pub stack_size: u64,
    pub heap_size: u64,
}

const DEFAULT_STACK_SIZE: u64 = 64 * 1024;
const DEFAULT_HEAP_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub domain: DomainId,
    pub state: ProcessState,
    pub entry_point: u64,
    pub code_base: VirtAddr,
    pub data_base: VirtAddr,
    pub stack_base: VirtAddr,
    pub heap_base: VirtAddr,
    pub argc: usize,
    pub exit_code: Option<i32>,
    pub thread: Option<ThreadId>,
    code_phys: PhysAddr,
    data_phys: PhysAddr,
    stack_phys: PhysAddr,
    heap_phys: PhysAddr,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn page_aligned(size: u64) -> u64 {
    frames_for(size.max(1)) * FRAME_SIZE
}

pub struct ProcessManager {
    processes: BTreeMap<Pid, Process>,
    next_pid: Pid,
}

impl ProcessManager {
    pub const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Allocate physical memory for `image`'s code, data, heap, and stack,
    /// create a domain and its page tables, map each region, and spawn the
    /// process's initial thread. A process never exists without a runnable
    /// thread in this core, unlike a service, which is `create`d separately
    /// from being `start`ed.
    pub fn create(
        &mut self,
        image: &ProcessImage,
        parent: Option<Pid>,
        argc: usize,
    ) -> Result<Pid, ProcessError> {
        let code_size = page_aligned(image.code_size);
        let data_size = page_aligned(image.data_size);
        let stack_size = page_aligned(if image.stack_size == 0 { DEFAULT_STACK_SIZE } else { image.stack_size });
        let heap_size = page_aligned(if image.heap_size == 0 { DEFAULT_HEAP_SIZE } else { image.heap_size });

        let domain = cap::create_domain(0, code_size + data_size + stack_size + heap_size);
        isolation::create_page_tables(domain, DomainFlags::App).map_err(|_| {
            let _ = cap::destroy_domain(domain);
            ProcessError::LoadFailed
        })?;

        let code_phys = pmm::alloc(code_size, FRAME_SIZE, FrameType::Application, domain);
        let data_phys = pmm::alloc(data_size, FRAME_SIZE, FrameType::Application, domain);
        let heap_phys = pmm::alloc(heap_size, FRAME_SIZE, FrameType::Application, domain);
        let stack_phys = pmm::alloc(stack_size, FRAME_SIZE, FrameType::Application, domain);
        if [code_phys, data_phys, heap_phys, stack_phys]
            .iter()
            .any(|a| a.as_u64() == 0)
        {
            for a in [code_phys, data_phys, heap_phys, stack_phys] {
                let _ = pmm::free(a);
            }
            let _ = cap::destroy_domain(domain);
            return Err(ProcessError::LoadFailed);
        }

        let code_va = VirtAddr::new(addr::USER_BASE);
        let data_va = VirtAddr::new(code_va.as_u64() + code_size);
        let heap_va = VirtAddr::new(data_va.as_u64() + data_size);
        let stack_va = VirtAddr::new(align_up(addr::USER_LIMIT - stack_size, FRAME_SIZE));

        let result = (|| -> Result<(), ProcessError> {
            map_region(domain, code_va, code_phys, code_size, MapType::Code, Permissions::READ | Permissions::EXECUTE)?;
            map_region(domain, data_va, data_phys, data_size, MapType::Data, Permissions::READ | Permissions::WRITE)?;
            map_region(domain, heap_va, heap_phys, heap_size, MapType::Data, Permissions::READ | Permissions::WRITE)?;
            map_region(domain, stack_va, stack_phys, stack_size, MapType::Data, Permissions::READ | Permissions::WRITE)?;
            Ok(())
        })();
        if result.is_err() {
            for a in [code_phys, data_phys, heap_phys, stack_phys] {
                let _ = pmm::free(a);
            }
            let _ = cap::destroy_domain(domain);
            return Err(ProcessError::LoadFailed);
        }

        let pid = self.next_pid;
        self.next_pid = self.next_pid.checked_add(1).ok_or(ProcessError::TableFull)?;

        let tid = sched::create_thread(domain, process_entry_trampoline, pid as u64, Priority::Normal)
            .map_err(|_| ProcessError::TableFull)?;

        self.processes.insert(
            pid,
            Process {
                pid,
                parent_pid: parent,
                domain,
                state: ProcessState::Ready,
                entry_point: image.entry_point,
                code_base: code_va,
                data_base: data_va,
                stack_base: stack_va,
                heap_base: heap_va,
                argc,
                exit_code: None,
                thread: Some(tid),
                code_phys,
                data_phys,
                stack_phys,
                heap_phys,
            },
        );
        Ok(pid)
    }

    fn get(&self, pid: Pid) -> Result<&Process, ProcessError> {
        self.processes.get(&pid).ok_or(ProcessError::UnknownProcess)
    }

    /// Mark the process owning `domain` `Terminated`, tear down its thread,
    /// free its four physical regions, and destroy its domain (and every
    /// capability it held). A domain stops resolving to a process once that
    /// process is `Terminated` -- a second `exit` for the same domain (a
    /// fault-driven exit racing a manual one, say) finds nothing to tear
    /// down a second time and reports `UnknownProcess` rather than double
    /// freeing already-released memory.
    pub fn exit(&mut self, domain: DomainId, code: i32) -> Result<(), ProcessError> {
        let pid = self
            .processes
            .values()
            .find(|p| p.domain == domain && p.state != ProcessState::Terminated)
            .map(|p| p.pid)
            .ok_or(ProcessError::UnknownProcess)?;
        let proc = self.processes.get_mut(&pid).expect("pid just found above");
        proc.state = ProcessState::Terminated;
        proc.exit_code = Some(code);
        if let Some(tid) = proc.thread.take() {
            let _ = sched::terminate_thread(tid);
        }
        for a in [proc.code_phys, proc.data_phys, proc.heap_phys, proc.stack_phys] {
            let _ = pmm::free(a);
        }
        let _ = cap::destroy_domain(proc.domain);
        Ok(())
    }

    pub fn state(&self, pid: Pid) -> Result<ProcessState, ProcessError> {
        self.get(pid).map(|p| p.state)
    }

    pub fn pid_of_domain(&self, domain: DomainId) -> Option<Pid> {
        self.processes.values().find(|p| p.domain == domain).map(|p| p.pid)
    }

    pub fn domain_of_pid(&self, pid: Pid) -> Option<DomainId> {
        self.get(pid).ok().map(|p| p.domain)
    }

    pub fn parent_pid(&self, pid: Pid) -> Option<Pid> {
        self.get(pid).ok().and_then(|p| p.parent_pid)
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
fn map_region(
    domain: DomainId,
    va: VirtAddr,
    pa: PhysAddr,
    size: u64,
    map_type: MapType,
    perms: Permissions,
) -> Result<(), ProcessError> {
    let cap = cap::create(CapabilityKind::Memory, perms, 0, pa.as_u64(), size, domain)
        .map_err(|_| ProcessError::LoadFailed)?;
    isolation::map(domain, va, pa, size, map_type, cap).map_err(|_| ProcessError::LoadFailed)
}

/// Kernel-side trampoline every freshly created process thread starts in.
/// Looks itself up by pid to find the real entry point and user stack, then
/// hands off to ring 3. On bare metal that handoff is an architecture-level
/// privilege transition this core doesn't model (see DESIGN.md); on the host
/// test target there's no ring 3 to enter.
extern "C" fn process_entry_trampoline(pid: u64) -> ! {
    if let Some(proc) = PROCESSES.lock().processes.get_mut(&(pid as Pid)) {
        if proc.state != ProcessState::Terminated {
            proc.state = ProcessState::Running;
        }
    }
    #[cfg(target_os = "none")]
    loop {
        x86_64::instructions::hlt();
    }
    #[cfg(not(target_os = "none"))]
    loop {
        core::hint::spin_loop();
    }
}

static PROCESSES: Mutex<ProcessManager> = Mutex::new(ProcessManager::new());

pub fn create(image: &ProcessImage, parent: Option<Pid>, argc: usize) -> Result<Pid, ProcessError> {
    PROCESSES.lock().create(image, parent, argc)
}

pub fn exit(domain: DomainId, code: i32) -> Result<(), ProcessError> {
    PROCESSES.lock().exit(domain, code)
}

pub fn state(pid: Pid) -> Result<ProcessState, ProcessError> {
    PROCESSES.lock().state(pid)
}

pub fn pid_of_domain(domain: DomainId) -> Option<Pid> {
    PROCESSES.lock().pid_of_domain(domain)
}

pub fn domain_of_pid(pid: Pid) -> Option<DomainId> {
    PROCESSES.lock().domain_of_pid(pid)
}

pub fn parent_pid(pid: Pid) -> Option<Pid> {
    PROCESSES.lock().parent_pid(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ProcessImage {
        ProcessImage {
            path: "/bin/init",
            entry_point: 0x40_0000,
            code_size: 4096,
            data_size: 4096,
            stack_size: 0,
            heap_size: 0,
        }
    }

    #[test]
    fn create_maps_all_four_regions() {
        let mut mgr = ProcessManager::new();
        let pid = mgr.create(&image(), None, 0).unwrap();
        let proc = mgr.get(pid).unwrap();
        assert_eq!(proc.state, ProcessState::Ready);

        isolation::verify_access(proc.domain, proc.code_base, FRAME_SIZE, Permissions::READ).unwrap();
        isolation::verify_access(proc.domain, proc.data_base, FRAME_SIZE, Permissions::WRITE).unwrap();
        isolation::verify_access(proc.domain, proc.heap_base, FRAME_SIZE, Permissions::WRITE).unwrap();
        isolation::verify_access(proc.domain, proc.stack_base, FRAME_SIZE, Permissions::WRITE).unwrap();
    }

    #[test]
    fn pids_are_unique_and_increasing() {
        let mut mgr = ProcessManager::new();
        let a = mgr.create(&image(), None, 0).unwrap();
        let b = mgr.create(&image(), Some(a), 0).unwrap();
        assert!(b > a);
        assert_eq!(mgr.parent_pid(b), Some(a));
    }

    #[test]
    fn exit_frees_memory_and_second_exit_is_unknown_process() {
        let mut mgr = ProcessManager::new();
        let pid = mgr.create(&image(), None, 0).unwrap();
        let domain = mgr.get(pid).unwrap().domain;

        mgr.exit(domain, 0).unwrap();
        assert_eq!(mgr.state(pid).unwrap(), ProcessState::Terminated);

        // A second exit for the same domain no longer resolves to a live
        // process, so it's reported as UnknownProcess rather than double
        // freeing already-released memory.
        assert_eq!(mgr.exit(domain, 0), Err(ProcessError::UnknownProcess));
    }

    #[test]
    fn pid_of_domain_resolves_current_process() {
        let mut mgr = ProcessManager::new();
        let pid = mgr.create(&image(), None, 0).unwrap();
        let domain = mgr.get(pid).unwrap().domain;
        assert_eq!(mgr.pid_of_domain(domain), Some(pid));
    }
}
