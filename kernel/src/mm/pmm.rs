//! Physical memory manager: a page-granular, typed-bitmap frame allocator.
//!
//! The bitmap is a flat array of `(type, owner)` pairs rather than a literal
//! bit array, because the kernel needs to answer "who owns frame N and as
//! what" in O(1) -- a single bit could not carry that. Every allocation's
//! run length is recorded separately so `free` can release a multi-frame
//! allocation atomically instead of the single-frame release a naive bitmap
//! walk would give you.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::bootinfo::{BootInfo, MemoryMapEntryType};
use crate::mm::{frames_for, PhysAddr, FRAME_SIZE};

/// Classification carried by every frame in the bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Reserved,
    Available,
    Kernel,
    Service,
    Application,
    Device,
    Custom,
}

#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    ty: FrameType,
    owner: u32,
}

impl FrameEntry {
    const fn reserved() -> Self {
        Self {
            ty: FrameType::Reserved,
            owner: 0,
        }
    }
}

/// Snapshot of allocator occupancy, exposed for the boot log and debug dumps.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
    pub largest_free_run: u64,
}

/// Errors returned by the allocator's non-allocating operations. `alloc`
/// itself keeps the source's sentinel-return contract: zero means failure,
/// because frame 0 is permanently reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    UnknownAllocation,
}

/// Frame-granular allocator state. A bare value type so tests can construct
/// independent instances instead of racing on kernel-wide global state; the
/// kernel itself drives a single instance through the `static` below.
pub struct Pmm {
    frames: Vec<FrameEntry>,
    // Run length in frames, keyed by the base frame index of an active
    // allocation or reservation. Lets `free` release the whole run.
    runs: BTreeMap<u64, u64>,
    available: u64,
    allocated: u64,
}

impl Pmm {
    pub const fn new() -> Self {
        Self {
            frames: Vec::new(),
            runs: BTreeMap::new(),
            available: 0,
            allocated: 0,
        }
    }

    /// Zero the bitmap to hold `total_bytes` worth of frames, all `Reserved`.
    pub fn init(&mut self, total_bytes: u64) {
        let frame_count = frames_for(total_bytes) as usize;
        self.frames = vec![FrameEntry::reserved(); frame_count];
        self.runs.clear();
        self.available = 0;
        self.allocated = 0;
    }

    fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    /// First-fit scan for `needed` contiguous `Available` frames whose base
    /// is a multiple of `align_frames`. The whole scan-and-commit happens
    /// under the caller's lock, so two racing allocators never settle on the
    /// same candidate run.
    pub fn alloc(&mut self, size: u64, align: u64, ty: FrameType, owner: u32) -> PhysAddr {
        let needed = frames_for(size).max(1);
        let align_frames = (align / FRAME_SIZE).max(1);
        let total = self.frame_count();

        let mut base = 0u64;
        while base + needed <= total {
            if base % align_frames != 0 {
                // Misaligned candidate: restart scanning from the next
                // aligned frame rather than rejecting the run outright.
                base += align_frames - (base % align_frames);
                continue;
            }
            let run_is_free = (base..base + needed)
                .all(|f| self.frames[f as usize].ty == FrameType::Available);
            if run_is_free {
                for f in base..base + needed {
                    self.frames[f as usize] = FrameEntry { ty, owner };
                }
                self.runs.insert(base, needed);
                self.available -= needed;
                self.allocated += needed;
                return PhysAddr::new(base * FRAME_SIZE);
            }
            base += 1;
        }
        PhysAddr::new(0)
    }

    /// Release the entire run that was allocated or reserved starting at
    /// `addr`'s frame, restoring every frame in it to `Available`/`owner=0`.
    pub fn free(&mut self, addr: PhysAddr) -> Result<(), PmmError> {
        let base = addr.frame_index();
        let len = self
            .runs
            .remove(&base)
            .ok_or(PmmError::UnknownAllocation)?;
        for f in base..base + len {
            self.frames[f as usize] = FrameEntry {
                ty: FrameType::Available,
                owner: 0,
            };
        }
        self.available += len;
        self.allocated -= len;
        Ok(())
    }

    /// Idempotently mark `[base, base+size)` as `(ty, owner)`. Used both to
    /// carve out reserved regions and to reclassify a usable memory-map
    /// range as `Available` during boot.
    pub fn reserve(&mut self, base: PhysAddr, size: u64, ty: FrameType, owner: u32) {
        let start = base.frame_index();
        let len = frames_for(size).max(1);
        let end = (start + len).min(self.frame_count());
        if start >= end {
            return;
        }
        for f in start..end {
            let entry = &mut self.frames[f as usize];
            let was_counted = entry.ty != FrameType::Reserved;
            let will_be_counted = ty != FrameType::Reserved;
            if was_counted && !will_be_counted {
                if entry.ty == FrameType::Available {
                    self.available -= 1;
                } else {
                    self.allocated -= 1;
                }
            } else if !was_counted && will_be_counted {
                if ty == FrameType::Available {
                    self.available += 1;
                } else {
                    self.allocated += 1;
                }
            } else if was_counted && will_be_counted {
                match (entry.ty == FrameType::Available, ty == FrameType::Available) {
                    (true, false) => {
                        self.available -= 1;
                        self.allocated += 1;
                    }
                    (false, true) => {
                        self.allocated -= 1;
                        self.available += 1;
                    }
                    _ => {}
                }
            }
            *entry = FrameEntry { ty, owner };
        }
        self.runs.insert(start, end - start);
    }

    pub fn stats(&self) -> PmmStats {
        let mut largest = 0u64;
        let mut run = 0u64;
        for entry in &self.frames {
            if entry.ty == FrameType::Available {
                run += 1;
                largest = largest.max(run);
            } else {
                run = 0;
            }
        }
        PmmStats {
            total: self.frame_count(),
            available: self.available,
            allocated: self.allocated,
            largest_free_run: largest,
        }
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
static PMM: Mutex<Pmm> = Mutex::new(Pmm::new());

// Host test target: there is no bootloader to hand `init` a memory map, and
// every subsystem's tests call the free functions below directly (the same
// way they'd call them in the running kernel) rather than constructing a
// private `Pmm`. Seed a generous, fully `Available` region up front instead
// of requiring every call site to invoke `init` first; domain ids and
// handles are process-wide monotonic counters, so concurrent tests never
// collide on the frames they allocate from this shared pool.
#[cfg(not(target_os = "none"))]
const TEST_DEFAULT_BYTES: u64 = 256 * 1024 * 1024;

#[cfg(not(target_os = "none"))]
lazy_static::lazy_static! {
    static ref PMM: Mutex<Pmm> = {
        let mut pmm = Pmm::new();
        pmm.init(TEST_DEFAULT_BYTES);
        pmm.reserve(PhysAddr::new(0), TEST_DEFAULT_BYTES, FrameType::Available, 0);
        // Frame 0 stays reserved even in the test default, so `alloc`'s zero
        // return keeps meaning "failure" here too.
        pmm.reserve(PhysAddr::new(0), FRAME_SIZE, FrameType::Reserved, 0);
        Mutex::new(pmm)
    };
}

/// Bring up the kernel-wide allocator from the bootloader's memory map.
/// Called exactly once, from `kernel_init`, before any other subsystem
/// touches physical memory.
pub fn init(boot_info: &BootInfo) {
    let mut pmm = PMM.lock();
    pmm.init(boot_info.highest_address());
    for entry in boot_info.memory_map {
        let ty = match entry.entry_type {
            MemoryMapEntryType::Usable => FrameType::Available,
            _ => FrameType::Reserved,
        };
        pmm.reserve(PhysAddr::new(entry.base_addr), entry.length_bytes, ty, 0);
    }
    // Frame 0 is permanently reserved: `alloc`'s zero return must never
    // collide with a real address, no matter what the memory map says.
    pmm.reserve(PhysAddr::new(0), FRAME_SIZE, FrameType::Reserved, 0);

    let stats = pmm.stats();
    log::info!(
        "pmm: {} frames total, {} available, {} allocated",
        stats.total,
        stats.available,
        stats.allocated
    );
}

pub fn alloc(size: u64, align: u64, ty: FrameType, owner: u32) -> PhysAddr {
    PMM.lock().alloc(size, align, ty, owner)
}

pub fn free(addr: PhysAddr) -> Result<(), PmmError> {
    PMM.lock().free(addr)
}

pub fn reserve(base: PhysAddr, size: u64, ty: FrameType, owner: u32) {
    PMM.lock().reserve(base, size, ty, owner)
}

pub fn stats() -> PmmStats {
    PMM.lock().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_lifecycle_e2e1() {
        let mut pmm = Pmm::new();
        pmm.init(16 * 1024);
        pmm.reserve(PhysAddr::new(0), 16 * 1024, FrameType::Available, 0);
        assert_eq!(pmm.stats().available, 4);

        let a = pmm.alloc(4096, 4096, FrameType::Kernel, 7);
        assert_eq!(a, PhysAddr::new(0));

        let b = pmm.alloc(8192, 4096, FrameType::Service, 9);
        assert_eq!(b, PhysAddr::new(4096));

        assert_eq!(pmm.stats().available, 1);
        assert_eq!(pmm.stats().allocated, 3);

        pmm.free(PhysAddr::new(0)).unwrap();
        assert_eq!(pmm.stats().available, 2);

        let a2 = pmm.alloc(4096, 4096, FrameType::Kernel, 7);
        assert_eq!(a2, PhysAddr::new(0));
    }

    #[test]
    fn multi_frame_free_restores_whole_run_e2e7() {
        let mut pmm = Pmm::new();
        pmm.init(64 * 1024);
        pmm.reserve(PhysAddr::new(0), 64 * 1024, FrameType::Available, 0);

        let base = pmm.alloc(3 * 4096, 4096, FrameType::Service, 9);
        assert_ne!(base, PhysAddr::new(0));
        assert_eq!(pmm.stats().allocated, 3);

        pmm.free(base).unwrap();
        assert_eq!(pmm.stats().allocated, 0);

        let base2 = pmm.alloc(3 * 4096, 4096, FrameType::Service, 9);
        assert_eq!(base, base2);
    }

    #[test]
    fn alloc_respects_alignment() {
        let mut pmm = Pmm::new();
        pmm.init(64 * 1024);
        pmm.reserve(PhysAddr::new(0), 64 * 1024, FrameType::Available, 0);

        // Burn frame 0 so the next candidate for an 8 KiB-aligned request
        // must skip ahead to a properly aligned frame.
        let _ = pmm.alloc(4096, 4096, FrameType::Kernel, 1);
        let addr = pmm.alloc(4096, 8192, FrameType::Kernel, 1);
        assert_eq!(addr.as_u64() % 8192, 0);
    }

    #[test]
    fn alloc_fails_closed_when_exhausted() {
        let mut pmm = Pmm::new();
        pmm.init(8192);
        pmm.reserve(PhysAddr::new(0), 8192, FrameType::Available, 0);
        assert_ne!(pmm.alloc(8192, 4096, FrameType::Kernel, 1), PhysAddr::new(0));
        assert_eq!(pmm.alloc(4096, 4096, FrameType::Kernel, 1), PhysAddr::new(0));
    }

    #[test]
    fn conservation_holds_across_alloc_free_reserve() {
        let mut pmm = Pmm::new();
        pmm.init(32 * 1024);
        pmm.reserve(PhysAddr::new(0), 32 * 1024, FrameType::Available, 0);
        let before = pmm.stats();
        let a = pmm.alloc(4096, 4096, FrameType::Application, 3);
        let b = pmm.alloc(4096, 4096, FrameType::Application, 3);
        pmm.free(a).unwrap();
        pmm.free(b).unwrap();
        let after = pmm.stats();
        assert_eq!(
            before.available + before.allocated,
            after.available + after.allocated
        );
    }

    #[test]
    fn free_of_unknown_address_is_reported() {
        let mut pmm = Pmm::new();
        pmm.init(8192);
        assert_eq!(pmm.free(PhysAddr::new(4096)), Err(PmmError::UnknownAllocation));
    }
}
