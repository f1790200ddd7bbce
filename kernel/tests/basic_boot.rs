//! Boots the kernel's init sequence for real under QEMU and exercises a
//! handful of subsystems end to end.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use hikari_kernel::bootinfo::{BootFlags, BootInfo, MemoryMapEntry, MemoryMapEntryType};
use hikari_kernel::test_framework::{exit_qemu, test_panic_handler, QemuExitCode};
use hikari_kernel::{arch, cap, kernel_init, println};

static MEMORY_MAP: [MemoryMapEntry; 1] = [MemoryMapEntry {
    base_addr: 0x0,
    length_bytes: 64 * 1024 * 1024,
    entry_type: MemoryMapEntryType::Usable,
    attributes: 0,
}];

#[no_mangle]
pub extern "C" fn _start() -> ! {
    arch::x86_64::serial::init();
    arch::x86_64::serial::init_logging();
    arch::x86_64::init();

    println!("starting basic boot test...");

    let boot_info = BootInfo {
        version: 1,
        flags: BootFlags::SERIAL,
        memory_map: &MEMORY_MAP,
        rsdp: 0,
        kernel_base: 0,
        kernel_size: 0,
        entry_point: 0,
        cmdline: "",
    };

    kernel_init(&boot_info);

    test_kernel_domain_exists();

    println!("all tests passed!");
    exit_qemu(QemuExitCode::Success)
}

fn test_kernel_domain_exists() {
    // `cap::init` must have run as part of `kernel_init` above, so the
    // kernel domain is already addressable.
    let domain = cap::kernel_domain();
    assert!(cap::domain_state(domain).is_ok());
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
