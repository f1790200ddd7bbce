pub mod boot;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod serial;

/// Bring up the CPU-local architectural state: GDT/TSS, IDT, and the legacy
/// PIC remap. Called once from `kernel_init` before any subsystem that
/// expects interrupts to be routable.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
}
