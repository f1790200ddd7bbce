//! Legacy 8259 PIC remap.
//!
//! This core is single-CPU and has no APIC requirement; the PIC remap keeps
//! IRQ0-15 out of the CPU exception range (0-31) and is the source of the
//! scheduler's timer tick and keyboard IRQ.

use pic8259::ChainedPics;
use spin::Mutex;

use super::idt::PIC_1_OFFSET;

const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub fn init() {
    unsafe { PICS.lock().initialize() };
}

/// Signal end-of-interrupt for `vector`. Must be called exactly once per
/// hardware IRQ handled, after the handler body runs.
///
/// # Safety
/// `vector` must be the vector of the interrupt currently being serviced.
pub unsafe fn notify_end_of_interrupt(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}
