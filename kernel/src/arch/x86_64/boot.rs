//! Raw boot-info ingestion: turns the bootloader's packed C record into the
//! validated `bootinfo::BootInfo` the rest of the kernel consumes.

use core::slice;

use crate::bootinfo::{BootFlags, BootInfo, BootInfoError, MemoryMapEntry, MemoryMapEntryType};

/// Mirrors the bootloader's packed handoff record. Field order and sizes are
/// fixed by the external bootloader contract and must not be reordered.
#[repr(C, packed)]
struct RawBootInfo {
    magic: u32,
    version: u32,
    flags: u32,
    memory_map_base: u64,
    memory_map_size: u64,
    memory_map_desc_size: u64,
    memory_map_count: u64,
    rsdp: u64,
    kernel_base: u64,
    kernel_size: u64,
    entry_point: u64,
    cmdline: [u8; 256],
    modules: u64,
    module_count: u64,
}

#[repr(C, packed)]
struct RawMemoryMapEntry {
    base_addr: u64,
    length_bytes: u64,
    entry_type: u32,
    attributes: u32,
}

/// Parse the boot-info record at `phys_addr`.
///
/// # Safety
/// `phys_addr` must point to a valid, bootloader-populated `RawBootInfo`
/// whose memory map array is reachable for at least `memory_map_count`
/// entries, identity-mapped at this point in boot.
pub unsafe fn parse(phys_addr: u64) -> Result<BootInfo, BootInfoError> {
    let raw = unsafe { &*(phys_addr as *const RawBootInfo) };
    BootInfo::validate(raw.magic, raw.version)?;

    let entries = unsafe {
        slice::from_raw_parts(
            raw.memory_map_base as *const RawMemoryMapEntry,
            raw.memory_map_count as usize,
        )
    };

    // Leaked intentionally: the memory map outlives the entire kernel
    // lifetime (there is no point at which it would be freed).
    let parsed: &'static mut [MemoryMapEntry] = {
        #[cfg(feature = "alloc")]
        {
            use alloc::vec::Vec;
            let v: Vec<MemoryMapEntry> = entries
                .iter()
                .map(|e| MemoryMapEntry {
                    base_addr: e.base_addr,
                    length_bytes: e.length_bytes,
                    entry_type: MemoryMapEntryType::from_raw(e.entry_type),
                    attributes: e.attributes,
                })
                .collect();
            v.leak()
        }
        #[cfg(not(feature = "alloc"))]
        {
            &mut []
        }
    };

    let cmdline_len = raw
        .cmdline
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(raw.cmdline.len());
    let cmdline = core::str::from_utf8(&raw.cmdline[..cmdline_len]).unwrap_or("");

    Ok(BootInfo {
        version: raw.version,
        flags: BootFlags::from_bits_truncate(raw.flags),
        memory_map: parsed,
        rsdp: raw.rsdp,
        kernel_base: raw.kernel_base,
        kernel_size: raw.kernel_size,
        entry_point: raw.entry_point,
        cmdline,
    })
}
