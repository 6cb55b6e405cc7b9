// =============================================================================
// AsterOS - Physical Memory Manager
// =============================================================================
//
// Hands out and reclaims 4 KiB physical frames. Every usable entry of the
// boot memory map becomes a `MemoryRegion`; each region keeps a doubly
// linked free list whose nodes are stored *inside* the free frames
// themselves, addressed through the HHDM. An allocated frame carries no
// bookkeeping at all.
//
// Allocation scans regions in discovery order and pops the head of the
// first non-empty list, so results are reproducible. Freeing pushes the
// frame back on the owning region's head: an allocate/free pair with no
// interleaving allocations returns the same frame again (LIFO per
// region).
//
// Region records live in the eternal heap; the region chain is fixed
// after init. All public functions take the PMM spinlock.
// =============================================================================

use ksync::SpinLock;

use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::memory::eternal;

/// Snapshot of physical memory statistics.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub region_count: usize,
}

/// Free-list node, stored in the first bytes of each free frame (via its
/// HHDM mapping).
#[repr(C)]
struct FreeListNode {
    prev: *mut FreeListNode,
    next: *mut FreeListNode,
}

/// One usable region of physical memory.
///
/// Invariants: `free_count` equals the length of the list, all node
/// addresses fall inside `[start, start + length_pages * 4096)`, and
/// `head.is_null()` exactly when `free_count == 0`.
struct MemoryRegion {
    /// First physical address of the region.
    start: u64,
    /// Region length in pages.
    length_pages: u64,
    /// Frames currently on the free list.
    free_count: u64,
    /// Head of the intrusive free list.
    head: *mut FreeListNode,
    /// Tail of the intrusive free list.
    tail: *mut FreeListNode,
    /// Next region in discovery order.
    next: *mut MemoryRegion,
}

impl MemoryRegion {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.length_pages * PAGE_SIZE
    }

    /// Pop the head of the free list. The region must not be empty.
    fn remove_first(&mut self) -> PhysAddr {
        let first = self.head;
        debug_assert!(!first.is_null());

        // SAFETY: head points into a free frame this region owns.
        unsafe {
            let next = (*first).next;
            if !next.is_null() {
                (*next).prev = core::ptr::null_mut();
            }
            self.head = next;
            if self.tail == first {
                self.tail = core::ptr::null_mut();
            }
        }

        self.free_count -= 1;
        PhysAddr::new(first as u64 - crate::memory::address::hhdm_offset())
    }

    /// Push a frame on the head of the free list.
    fn push_front(&mut self, addr: PhysAddr) {
        let node = addr.to_virt().as_mut_ptr::<FreeListNode>();

        // SAFETY: the frame belongs to this region and is being retired
        // from use; writing link words into it is ours to do.
        unsafe {
            (*node).prev = core::ptr::null_mut();
            (*node).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = node;
            }
            self.head = node;
            if self.tail.is_null() {
                self.tail = node;
            }
        }

        self.free_count += 1;
    }

    /// Thread every frame of the region into the free list, ascending.
    fn build_free_list(&mut self) {
        let base = PhysAddr::new(self.start).to_virt().as_u64();
        let mut prev: *mut FreeListNode = core::ptr::null_mut();

        for i in 0..self.length_pages {
            let node = (base + i * PAGE_SIZE) as *mut FreeListNode;
            // SAFETY: every frame in the region is usable RAM under the
            // HHDM mapping.
            unsafe {
                (*node).prev = prev;
                (*node).next = core::ptr::null_mut();
                if !prev.is_null() {
                    (*prev).next = node;
                }
            }
            if i == 0 {
                self.head = node;
            }
            prev = node;
        }

        self.tail = prev;
        self.free_count = self.length_pages;
    }
}

/// The region chain plus frozen totals.
struct Pmm {
    first: *mut MemoryRegion,
    last: *mut MemoryRegion,
    total_pages: u64,
}

// SAFETY: the raw region pointers are only dereferenced under the PMM
// lock; the regions themselves live forever in the eternal heap.
unsafe impl Send for Pmm {}

static PMM: SpinLock<Pmm> = SpinLock::new(Pmm {
    first: core::ptr::null_mut(),
    last: core::ptr::null_mut(),
    total_pages: 0,
});

/// Build the region chain from the boot memory map.
///
/// Must run exactly once, on the BSP, before any allocation.
///
/// # Panics
/// If the eternal heap cannot hold a region record, or on double init.
pub fn init(memory_map: &[&limine::memory_map::Entry]) {
    let mut pmm = PMM.lock();
    assert!(pmm.first.is_null(), "PMM: init called more than once");

    for entry in memory_map {
        if entry.entry_type != limine::memory_map::EntryType::USABLE {
            continue;
        }

        let length_pages = entry.length / PAGE_SIZE;
        if length_pages == 0 {
            continue;
        }

        let mem = eternal::allocate(core::mem::size_of::<MemoryRegion>())
            .expect("PMM: eternal heap exhausted while recording regions")
            as *mut MemoryRegion;

        // SAFETY: fresh 16-byte-aligned eternal allocation of the right
        // size, written before first use.
        let region = unsafe {
            mem.write(MemoryRegion {
                start: entry.base,
                length_pages,
                free_count: 0,
                head: core::ptr::null_mut(),
                tail: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            });
            &mut *mem
        };

        region.build_free_list();

        if pmm.first.is_null() {
            pmm.first = region;
        } else {
            // SAFETY: last was set alongside first and points at an
            // eternal region record.
            unsafe {
                (*pmm.last).next = region;
            }
        }
        pmm.last = region;
        pmm.total_pages += length_pages;

        klog::debug!(
            "[pmm] region {:#012X}..{:#012X} ({} pages)",
            entry.base,
            entry.base + entry.length,
            length_pages
        );
    }

    klog::info!(
        "[pmm] {} usable pages ({} MiB) in {} regions",
        pmm.total_pages,
        pmm.total_pages * PAGE_SIZE / 1024 / 1024,
        {
            let mut n = 0;
            let mut r = pmm.first;
            while !r.is_null() {
                n += 1;
                r = unsafe { (*r).next };
            }
            n
        }
    );
}

/// Allocate one 4 KiB frame.
///
/// Scans regions in discovery order; the first region with a non-empty
/// free list yields its head. Returns `None` when every region is empty
/// (out of physical memory). Frame contents are whatever was there last.
pub fn allocate() -> Option<PhysAddr> {
    let pmm = PMM.lock();

    let mut region = pmm.first;
    while !region.is_null() {
        // SAFETY: region records are eternal; we hold the lock.
        let r = unsafe { &mut *region };
        if r.free_count > 0 && !r.head.is_null() {
            return Some(r.remove_first());
        }
        region = r.next;
    }

    None
}

/// Return a frame to its region.
///
/// Freeing an address outside every region is a recoverable error: it is
/// logged and ignored.
pub fn free(addr: PhysAddr) {
    let pmm = PMM.lock();

    let mut region = pmm.first;
    while !region.is_null() {
        // SAFETY: region records are eternal; we hold the lock.
        let r = unsafe { &mut *region };
        if r.contains(addr.as_u64()) {
            r.push_front(addr);
            return;
        }
        region = r.next;
    }

    klog::error!("[pmm] invalid free: {} is not in any region", addr);
}

/// Total usable pages. Frozen after `init`.
pub fn total_pages() -> u64 {
    PMM.lock().total_pages
}

/// Current statistics snapshot.
pub fn stats() -> PmmStats {
    let pmm = PMM.lock();
    let mut free_pages = 0;
    let mut region_count = 0;

    let mut region = pmm.first;
    while !region.is_null() {
        // SAFETY: region records are eternal; we hold the lock.
        let r = unsafe { &*region };
        free_pages += r.free_count;
        region_count += 1;
        region = r.next;
    }

    PmmStats {
        total_pages: pmm.total_pages,
        free_pages,
        region_count,
    }
}

/// Boot-time allocate/free round trip. The second allocation must return
/// the same frame as the first.
pub fn self_test() {
    let first = allocate().expect("PMM self-test: no frames");
    free(first);
    let second = allocate().expect("PMM self-test: no frames");
    free(second);

    if first == second {
        klog::debug!("[pmm] self-test: round trip reproduced {}", first);
    } else {
        klog::warn!(
            "[pmm] self-test: round trip returned {} then {}",
            first,
            second
        );
    }
}
