//! QEMU-backed support for the bare-metal integration tests under `tests/`.
//!
//! Host-side unit tests run under the ordinary `cargo test` harness and never
//! touch this module; these pieces exist only for the `harness = false`
//! binaries that boot for real under QEMU and need a way to report a result
//! and halt the VM instead of returning to a caller.

use core::panic::PanicInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU with `code` by writing to its isa-debug-exit device. Never
/// returns: QEMU tears the VM down before the instruction after the port
/// write would execute.
pub fn exit_qemu(code: QemuExitCode) -> ! {
    // Safety: port 0xf4 is the isa-debug-exit device QEMU is launched with
    // for these integration tests; writing to it is the documented way to
    // terminate the VM with a caller-chosen code.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut port = Port::new(0xf4);
        port.write(code as u32);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

/// Panic handler shared by every `tests/*.rs` integration binary: report the
/// panic over serial, then exit QEMU with [`QemuExitCode::Failed`].
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    crate::println!("[failed]\n{info}");
    exit_qemu(QemuExitCode::Failed)
}
