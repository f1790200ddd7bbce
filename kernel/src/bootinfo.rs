//! Boot-info record consumption.
//!
//! The bootloader (BIOS/UEFI, out of scope for this core) leaves a
//! `BootInfo` record at a fixed physical address before transferring
//! control. This module only ever *reads* that record; it never
//! re-implements any bootloader behavior.

/// ASCII "HIK!" as a little-endian u32, per the external bootloader contract.
pub const BOOT_INFO_MAGIC: u32 = 0x214B_4948;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootFlags: u32 {
        const SERIAL   = 1 << 0;
        const DEBUG    = 1 << 1;
        const GRAPHICS = 1 << 2;
        const SECURE   = 1 << 3;
    }
}

/// A single entry in the bootloader's memory map.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub base_addr: u64,
    pub length_bytes: u64,
    pub entry_type: MemoryMapEntryType,
    pub attributes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryMapEntryType {
    Usable = 1,
    Reserved = 2,
    AcpiReclaim = 3,
    Nvs = 4,
    Unusable = 5,
}

impl MemoryMapEntryType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaim,
            4 => Self::Nvs,
            _ => Self::Unusable,
        }
    }
}

/// Parsed handoff record from the bootloader. The bootloader constructs this
/// in physical memory before jumping to `_start`; `BootInfo::parse` only
/// validates and copies the fields the kernel needs.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub version: u32,
    pub flags: BootFlags,
    pub memory_map: &'static [MemoryMapEntry],
    pub rsdp: u64,
    pub kernel_base: u64,
    pub kernel_size: u64,
    pub entry_point: u64,
    pub cmdline: &'static str,
}

/// Errors returned while validating the raw boot-info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootInfoError {
    BadMagic,
    UnsupportedVersion,
}

impl BootInfo {
    /// Validate a raw handoff record's magic/version. The actual field
    /// extraction from the bootloader's packed C layout is architecture- and
    /// bootloader-specific and lives in `arch::x86_64::boot`; this function
    /// is the shared sanity check both paths run through.
    pub fn validate(magic: u32, version: u32) -> Result<(), BootInfoError> {
        if magic != BOOT_INFO_MAGIC {
            return Err(BootInfoError::BadMagic);
        }
        if version != 1 {
            return Err(BootInfoError::UnsupportedVersion);
        }
        Ok(())
    }

    /// Total usable bytes described by the memory map, used to size the PMM
    /// bitmap before any frame is classified.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|e| e.entry_type == MemoryMapEntryType::Usable)
            .map(|e| e.length_bytes)
            .sum()
    }

    /// Highest address described anywhere in the memory map (usable or not),
    /// which bounds the PMM bitmap size.
    pub fn highest_address(&self) -> u64 {
        self.memory_map
            .iter()
            .map(|e| e.base_addr + e.length_bytes)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_magic() {
        assert_eq!(
            BootInfo::validate(0xdead_beef, 1),
            Err(BootInfoError::BadMagic)
        );
    }

    #[test]
    fn validate_rejects_unknown_version() {
        assert_eq!(
            BootInfo::validate(BOOT_INFO_MAGIC, 2),
            Err(BootInfoError::UnsupportedVersion)
        );
    }

    #[test]
    fn validate_accepts_v1() {
        assert_eq!(BootInfo::validate(BOOT_INFO_MAGIC, 1), Ok(()));
    }

    #[test]
    fn usable_bytes_sums_only_usable_entries() {
        let entries = [
            MemoryMapEntry {
                base_addr: 0,
                length_bytes: 0x1000,
                entry_type: MemoryMapEntryType::Usable,
                attributes: 0,
            },
            MemoryMapEntry {
                base_addr: 0x1000,
                length_bytes: 0x2000,
                entry_type: MemoryMapEntryType::Reserved,
                attributes: 0,
            },
            MemoryMapEntry {
                base_addr: 0x3000,
                length_bytes: 0x4000,
                entry_type: MemoryMapEntryType::Usable,
                attributes: 0,
            },
        ];
        let info = BootInfo {
            version: 1,
            flags: BootFlags::SERIAL,
            memory_map: &entries,
            rsdp: 0,
            kernel_base: 0,
            kernel_size: 0,
            entry_point: 0,
            cmdline: "",
        };
        assert_eq!(info.usable_bytes(), 0x5000);
        assert_eq!(info.highest_address(), 0x7000);
    }
}
