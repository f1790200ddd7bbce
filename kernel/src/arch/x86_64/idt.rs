//! Interrupt Descriptor Table.
//!
//! Every vector funnels into `crate::irq::dispatch`, which applies the
//! capability-gated routing table described in the isolation/irq spec; this
//! module only owns the raw x86 entry points and the PIC EOI/timer plumbing.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{gdt::DOUBLE_FAULT_IST_INDEX, pic};
use crate::irq;

pub const PIC_1_OFFSET: u8 = 32;
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(exception_handler_div0);
        idt.breakpoint.set_handler_fn(exception_handler_breakpoint);
        idt.invalid_opcode.set_handler_fn(exception_handler_invalid_opcode);
        idt.general_protection_fault
            .set_handler_fn(exception_handler_gpf);
        idt.page_fault.set_handler_fn(exception_handler_page_fault);
        unsafe {
            idt.double_fault
                .set_handler_fn(exception_handler_double_fault)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }

        idt[TIMER_VECTOR as usize].set_handler_fn(timer_interrupt_handler);
        idt[KEYBOARD_VECTOR as usize].set_handler_fn(keyboard_interrupt_handler);

        idt
    };
}

/// Load the IDT. Must run after `gdt::init` so the double-fault IST index is
/// valid.
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn exception_handler_div0(frame: InterruptStackFrame) {
    irq::dispatch(0, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn exception_handler_breakpoint(frame: InterruptStackFrame) {
    irq::dispatch(3, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn exception_handler_invalid_opcode(frame: InterruptStackFrame) {
    irq::dispatch(6, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn exception_handler_gpf(frame: InterruptStackFrame, error_code: u64) {
    irq::dispatch(13, error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn exception_handler_page_fault(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    irq::dispatch(14, error_code.bits(), frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn exception_handler_double_fault(
    frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "double fault (error_code={error_code:#x}) at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn timer_interrupt_handler(frame: InterruptStackFrame) {
    irq::dispatch(TIMER_VECTOR as usize, 0, frame.instruction_pointer.as_u64());
    crate::sched::scheduler::schedule();
    unsafe { pic::notify_end_of_interrupt(TIMER_VECTOR) };
}

extern "x86-interrupt" fn keyboard_interrupt_handler(frame: InterruptStackFrame) {
    irq::dispatch(
        KEYBOARD_VECTOR as usize,
        0,
        frame.instruction_pointer.as_u64(),
    );
    unsafe { pic::notify_end_of_interrupt(KEYBOARD_VECTOR) };
}
