//! Isolation: per-domain page tables and the call-gate mechanism built on
//! top of them. One lock guards both, since every call gate invocation and
//! every map/unmap already goes through the capability system first (lock
//! order: capabilities -> isolation -> PMM, per the concurrency model).

pub mod addr;
pub mod callgate;
pub mod pagetable;

pub use addr::{
    is_device_address, is_kernel_address, is_user_address, DEVICE_BASE, KERNEL_BASE,
    KERNEL_CODE_BASE, USER_BASE, USER_LIMIT,
};
pub use callgate::{CallGate, GateId};
pub use pagetable::{DomainFlags, MapType};

use spin::Mutex;

use crate::cap::{DomainId, Handle, Permissions};
use crate::error::IsolationError;
use crate::mm::{PhysAddr, VirtAddr};

struct IsolationState {
    arena: pagetable::PageTableArena,
    gates: callgate::CallGateTable,
}

impl IsolationState {
    const fn new() -> Self {
        Self {
            arena: pagetable::PageTableArena::new(),
            gates: callgate::CallGateTable::new(),
        }
    }
}

static ISOLATION: Mutex<IsolationState> = Mutex::new(IsolationState::new());

/// Bring up the kernel's own page tables. Called once from `kernel_init`
/// after the capability system exists, so the kernel domain already has
/// somewhere to root its mappings.
pub fn init() {
    let kernel_domain = crate::cap::kernel_domain();
    ISOLATION
        .lock()
        .arena
        .create_page_tables(kernel_domain, DomainFlags::Kernel)
        .expect("kernel page tables: first allocation can't fail this early in boot");
    log::info!("isolation: kernel page tables created");
}

pub fn create_page_tables(domain: DomainId, flags: DomainFlags) -> Result<PhysAddr, IsolationError> {
    ISOLATION.lock().arena.create_page_tables(domain, flags)
}

pub fn map(
    domain: DomainId,
    va: VirtAddr,
    pa: PhysAddr,
    size: u64,
    map_type: MapType,
    cap: Handle,
) -> Result<(), IsolationError> {
    ISOLATION.lock().arena.map(domain, va, pa, size, map_type, cap)
}

pub fn unmap(domain: DomainId, va: VirtAddr, size: u64) -> Result<(), IsolationError> {
    ISOLATION.lock().arena.unmap(domain, va, size)
}

pub fn verify_access(
    domain: DomainId,
    addr: VirtAddr,
    size: u64,
    access: Permissions,
) -> Result<(), IsolationError> {
    ISOLATION.lock().arena.verify_access(domain, addr, size, access)
}

pub fn translate(domain: DomainId, va: VirtAddr) -> Option<(PhysAddr, x86_64::structures::paging::PageTableFlags)> {
    ISOLATION.lock().arena.translate(domain, va)
}

pub fn create_call_gate(
    creator_domain: DomainId,
    target_domain: DomainId,
    entry: u64,
    cap: Handle,
) -> Result<GateId, IsolationError> {
    ISOLATION
        .lock()
        .gates
        .create_call_gate(creator_domain, target_domain, entry, cap)
}

/// Verify the caller still holds the gate's governing capability and return
/// its target domain and entry point. The actual stack-switched transfer is
/// architecture code (see `arch::x86_64::context`); this is the gating check
/// every call path, real or simulated, must run first.
pub fn check_gate(gate_id: GateId, caller_domain: DomainId) -> Result<(DomainId, u64), IsolationError> {
    ISOLATION
        .lock()
        .gates
        .check_gate(gate_id, caller_domain)
        .map(|g| (g.target_domain, g.offset))
}

pub fn remove_call_gate(gate_id: GateId) {
    ISOLATION.lock().gates.remove(gate_id)
}
