//! Four-level x86-64 page tables, modeled as an arena of owned tables reached
//! by physical address rather than through bare pointers: the PML4 a domain
//! owns exclusively owns its PDPTs, which exclusively own their PDs, and so
//! on, exactly as the design notes ask for.
//!
//! Each table occupies a frame the PMM actually allocated, so intermediate
//! tables really do consume physical memory and can really run out; the
//! table's *contents* live in this arena rather than being written through a
//! raw pointer into that frame, since nothing else ever addresses it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use x86_64::structures::paging::{PageTable, PageTableFlags};

use crate::cap::{self, CapabilityKind, DomainId, Handle, Permissions};
use crate::error::IsolationError;
use crate::mm::{frames_for, pmm, PhysAddr, VirtAddr, FRAME_SIZE};

/// What a mapping is used for; determines the PTE flags `map` installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Code,
    Data,
    ReadOnly,
    Device,
    Shared,
}

impl MapType {
    fn flags(self) -> PageTableFlags {
        use PageTableFlags as F;
        match self {
            MapType::Code => F::PRESENT | F::USER_ACCESSIBLE,
            MapType::Data => F::PRESENT | F::WRITABLE | F::USER_ACCESSIBLE,
            MapType::ReadOnly => F::PRESENT | F::USER_ACCESSIBLE,
            MapType::Device => F::PRESENT | F::WRITABLE | F::WRITE_THROUGH | F::NO_CACHE,
            MapType::Shared => F::PRESENT | F::WRITABLE | F::USER_ACCESSIBLE,
        }
    }
}

/// What kind of domain a set of page tables belongs to; kept alongside the
/// PML4 so `map` can sanity-check flags against the owner's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainFlags {
    Kernel,
    Service,
    App,
}

struct DomainTables {
    pml4: PhysAddr,
    flags: DomainFlags,
}

/// Owns every page table frame in the system, indexed by the physical
/// address the PMM gave it. A table is only ever reached by looking it up
/// here -- never through a raw pointer derived from its physical address.
pub struct PageTableArena {
    domains: BTreeMap<DomainId, DomainTables>,
    tables: BTreeMap<u64, Box<PageTable>>,
}

impl PageTableArena {
    pub const fn new() -> Self {
        Self {
            domains: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    fn alloc_table(&mut self, owner: DomainId) -> Result<PhysAddr, IsolationError> {
        let frame = pmm::alloc(FRAME_SIZE, FRAME_SIZE, pmm::FrameType::Kernel, owner);
        if frame == PhysAddr::new(0) {
            return Err(IsolationError::TableFramesExhausted);
        }
        self.tables.insert(frame.as_u64(), Box::new(PageTable::new()));
        Ok(frame)
    }

    pub fn create_page_tables(
        &mut self,
        domain: DomainId,
        flags: DomainFlags,
    ) -> Result<PhysAddr, IsolationError> {
        let pml4 = self.alloc_table(domain)?;
        self.domains.insert(domain, DomainTables { pml4, flags });
        Ok(pml4)
    }

    pub fn domain_flags(&self, domain: DomainId) -> Option<DomainFlags> {
        self.domains.get(&domain).map(|d| d.flags)
    }

    fn table_mut(&mut self, addr: PhysAddr) -> &mut PageTable {
        self.tables
            .get_mut(&addr.as_u64())
            .expect("page table frame missing from arena: PMM/arena accounting diverged")
    }

    fn table(&self, addr: PhysAddr) -> &PageTable {
        self.tables
            .get(&addr.as_u64())
            .expect("page table frame missing from arena: PMM/arena accounting diverged")
    }

    /// Walk (and lazily allocate) down to the PT entry for `va`, creating
    /// any missing intermediate table along the way.
    fn walk_or_create(
        &mut self,
        domain: DomainId,
        va: VirtAddr,
    ) -> Result<(PhysAddr, usize), IsolationError> {
        let owner = self.domains.get(&domain).ok_or(IsolationError::UnknownDomain)?;
        let mut table_addr = owner.pml4;
        let xva = x86_64::VirtAddr::try_new(va.as_u64()).map_err(|_| IsolationError::InvalidAddress)?;
        let indices = [
            u16::from(xva.p4_index()) as usize,
            u16::from(xva.p3_index()) as usize,
            u16::from(xva.p2_index()) as usize,
        ];

        for idx in indices {
            let entry_addr = {
                let table = self.table(table_addr);
                let entry = &table[idx];
                if entry.is_unused() {
                    None
                } else {
                    Some(entry.addr())
                }
            };
            let next = match entry_addr {
                Some(addr) => PhysAddr::new(addr.as_u64()),
                None => {
                    let child = self.alloc_table(domain)?;
                    let table = self.table_mut(table_addr);
                    table[idx].set_addr(
                        x86_64::PhysAddr::new(child.as_u64()),
                        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                    );
                    child
                }
            };
            table_addr = next;
        }
        Ok((table_addr, u16::from(xva.p1_index()) as usize))
    }

    pub fn map(
        &mut self,
        domain: DomainId,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        map_type: MapType,
        cap: Handle,
    ) -> Result<(), IsolationError> {
        if !va.as_u64().is_multiple_of_page() || !pa.is_frame_aligned() || size % FRAME_SIZE != 0 {
            return Err(IsolationError::Unaligned);
        }
        let required = match map_type {
            MapType::ReadOnly => Permissions::READ,
            MapType::Code => Permissions::READ | Permissions::EXECUTE,
            _ => Permissions::READ | Permissions::WRITE,
        };
        let record = cap::record(cap).map_err(|_| IsolationError::MissingCapability)?;
        if record.kind != CapabilityKind::Memory
            || pa.as_u64() < record.base
            || pa.as_u64() + size > record.base + record.size
            || !record.perms.contains(required)
        {
            return Err(IsolationError::MissingCapability);
        }

        let flags = map_type.flags();
        // An assertion of last resort: our own flag table must never
        // produce a PTE that contradicts the mapping it claims to be.
        if map_type == MapType::ReadOnly && flags.contains(PageTableFlags::WRITABLE) {
            panic!("isolation: computed writable flags for a read-only mapping");
        }

        let pages = frames_for(size);
        for i in 0..pages {
            let page_va = VirtAddr::new(va.as_u64() + i * FRAME_SIZE);
            let page_pa = x86_64::PhysAddr::new(pa.as_u64() + i * FRAME_SIZE);
            let (pt_addr, pt_idx) = self.walk_or_create(domain, page_va)?;
            let table = self.table_mut(pt_addr);
            table[pt_idx].set_addr(page_pa, flags);
        }
        Ok(())
    }

    pub fn unmap(&mut self, domain: DomainId, va: VirtAddr, size: u64) -> Result<(), IsolationError> {
        if !va.as_u64().is_multiple_of_page() || size % FRAME_SIZE != 0 {
            return Err(IsolationError::Unaligned);
        }
        let pages = frames_for(size);
        for i in 0..pages {
            let page_va = VirtAddr::new(va.as_u64() + i * FRAME_SIZE);
            let (pt_addr, pt_idx) = self.walk_or_create(domain, page_va)?;
            let table = self.table_mut(pt_addr);
            table[pt_idx].set_unused();
            invalidate(page_va);
        }
        Ok(())
    }

    /// Walk `[addr, addr+size)` and succeed only if every page is present
    /// and satisfies the requested access bits.
    pub fn verify_access(
        &self,
        domain: DomainId,
        addr: VirtAddr,
        size: u64,
        access: Permissions,
    ) -> Result<(), IsolationError> {
        let owner = self.domains.get(&domain).ok_or(IsolationError::UnknownDomain)?;
        let pml4_addr = owner.pml4;
        let pages = frames_for(size).max(1);

        for i in 0..pages {
            let va = VirtAddr::new(addr.as_u64() + i * FRAME_SIZE);
            let xva = x86_64::VirtAddr::try_new(va.as_u64()).map_err(|_| IsolationError::InvalidAddress)?;
            let mut table_addr = pml4_addr;
            let mut pte_flags = None;
            for (depth, idx) in [
                u16::from(xva.p4_index()) as usize,
                u16::from(xva.p3_index()) as usize,
                u16::from(xva.p2_index()) as usize,
                u16::from(xva.p1_index()) as usize,
            ]
            .into_iter()
            .enumerate()
            {
                let table = self.table(table_addr);
                let entry = &table[idx];
                if entry.is_unused() {
                    return Err(IsolationError::NotMapped);
                }
                if depth == 3 {
                    pte_flags = Some(entry.flags());
                } else {
                    table_addr = PhysAddr::new(entry.addr().as_u64());
                }
            }
            let flags = pte_flags.ok_or(IsolationError::NotMapped)?;
            if access.contains(Permissions::WRITE) && !flags.contains(PageTableFlags::WRITABLE) {
                return Err(IsolationError::MissingCapability);
            }
            if !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                return Err(IsolationError::MissingCapability);
            }
        }
        Ok(())
    }

    /// Walk a single page for tests/diagnostics: returns the mapped frame
    /// and flags if present.
    pub fn translate(&self, domain: DomainId, va: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
        let owner = self.domains.get(&domain)?;
        let xva = x86_64::VirtAddr::try_new(va.as_u64()).ok()?;
        let mut table_addr = owner.pml4;
        for (depth, idx) in [
            u16::from(xva.p4_index()) as usize,
            u16::from(xva.p3_index()) as usize,
            u16::from(xva.p2_index()) as usize,
            u16::from(xva.p1_index()) as usize,
        ]
        .into_iter()
        .enumerate()
        {
            let table = self.table(table_addr);
            let entry = &table[idx];
            if entry.is_unused() {
                return None;
            }
            if depth == 3 {
                return Some((PhysAddr::new(entry.addr().as_u64()), entry.flags()));
            }
            table_addr = PhysAddr::new(entry.addr().as_u64());
        }
        None
    }
}

impl Default for PageTableArena {
    fn default() -> Self {
        Self::new()
    }
}

trait PageAligned {
    fn is_multiple_of_page(self) -> bool;
}

impl PageAligned for u64 {
    fn is_multiple_of_page(self) -> bool {
        self % FRAME_SIZE == 0
    }
}

/// Page-granular TLB invalidation for `va`. A no-op off bare metal, where
/// there is no TLB to shoot down.
fn invalidate(va: VirtAddr) {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va.as_u64()));
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = va;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_walk_then_unmap_e2e3() {
        let mut arena = PageTableArena::new();
        let domain = cap::create_domain(0, 0);
        let cap = cap::create(
            CapabilityKind::Memory,
            Permissions::READ | Permissions::WRITE,
            0,
            0x10_0000,
            0x1_0000,
            domain,
        )
        .unwrap();

        arena.create_page_tables(domain, DomainFlags::App).unwrap();
        arena
            .map(
                domain,
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x10_0000),
                0x1000,
                MapType::Data,
                cap,
            )
            .unwrap();

        let (frame, flags) = arena.translate(domain, VirtAddr::new(0x40_0000)).unwrap();
        assert_eq!(frame, PhysAddr::new(0x10_0000));
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));

        arena.unmap(domain, VirtAddr::new(0x40_0000), 0x1000).unwrap();
        assert!(arena.translate(domain, VirtAddr::new(0x40_0000)).is_none());
    }

    #[test]
    fn verify_access_fails_outside_any_mapping() {
        let mut arena = PageTableArena::new();
        let domain = cap::create_domain(0, 0);
        arena.create_page_tables(domain, DomainFlags::App).unwrap();
        assert_eq!(
            arena.verify_access(domain, VirtAddr::new(0x55_0000), 0x1000, Permissions::READ),
            Err(IsolationError::NotMapped)
        );
    }

    #[test]
    fn map_rejects_unaligned_arguments() {
        let mut arena = PageTableArena::new();
        let domain = cap::create_domain(0, 0);
        arena.create_page_tables(domain, DomainFlags::App).unwrap();
        let owner = cap::create_domain(0, 0);
        let cap = cap::create(
            CapabilityKind::Memory,
            Permissions::READ | Permissions::WRITE,
            0,
            0x10_0000,
            0x1000,
            owner,
        )
        .unwrap();
        assert_eq!(
            arena.map(domain, VirtAddr::new(0x40_0001), PhysAddr::new(0x10_0000), 0x1000, MapType::Data, cap),
            Err(IsolationError::Unaligned)
        );
    }
}
