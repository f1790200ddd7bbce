//! Hikari microkernel core
//!
//! Core-0: capability system, physical memory allocator, page-table isolation,
//! thread scheduler, interrupt router, service and process managers.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target (used by `cargo test`): delegate to the system allocator so
// unit tests can use Vec/BTreeMap/etc. normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod cap;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod isolation;
pub mod mm;
pub mod process;
pub mod sched;
pub mod service;
pub mod syscall;
pub mod test_framework;

/// Sequence every subsystem must be brought up in, leaves first.
///
/// Called once from `_start` after the bootloader hands off control. Never
/// called a second time -- kernel tables are initialized once and live for
/// the lifetime of the machine.
pub fn kernel_init(boot_info: &bootinfo::BootInfo) {
    log::info!("hikari-kernel: starting init sequence");

    mm::pmm::init(boot_info);
    cap::init();
    isolation::init();
    irq::init();
    sched::init();
    service::init();
    process::init();

    log::info!("hikari-kernel: init sequence complete");
}

