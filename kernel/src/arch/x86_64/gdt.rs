//! Global Descriptor Table and Task State Segment.
//!
//! Segmentation is mostly vestigial under long mode, but we still need a
//! TSS to hand the CPU a dedicated stack for double faults and for the
//! privilege-level 0 stack used on user -> kernel transitions through a
//! call gate.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.privilege_stack_table[0] = {
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
            stack_start + STACK_SIZE as u64
        };

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DF_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_start = VirtAddr::from_ptr(&raw const DF_STACK);
            stack_start + STACK_SIZE as u64
        };

        tss
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// Load the GDT, reload segment registers, and load the TSS.
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, SS},
        tables::load_tss,
    };

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    let _ = (GDT.1.user_data_selector, GDT.1.user_code_selector);
}

/// Kernel code segment selector, used when building IDT/call-gate entries.
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// User code segment selector (with RPL 3), used for `iretq` into Core-3.
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// User data segment selector (with RPL 3).
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}
