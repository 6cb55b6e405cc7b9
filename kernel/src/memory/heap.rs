// =============================================================================
// AsterOS - Kernel Heap Allocator
// =============================================================================
//
// A single 16 MiB virtual range, pre-mapped with demand pages so the
// physical frames arrive on first touch. Inside it, allocations form one
// doubly linked chain of magic-tagged nodes, each header immediately
// preceding its payload:
//
//   ┌────────────────────────────┬─────────────┬───────────────────────┐
//   │ magic │ prev │ next │ size │   payload   │ next node ...         │
//   └────────────────────────────┴─────────────┴───────────────────────┘
//
// The magic word distinguishes free from allocated nodes and catches
// double frees and stray pointers before they corrupt the chain.
//
// Allocation walks the chain for the best (smallest sufficient) free
// node, but stops early at the first "great fit" - a node at least
// GREAT_FIT_FACTOR times the request - trading placement quality for
// walk length. The factor is a runtime tunable. Nodes split on allocate
// when the remainder can host a header plus a minimum payload, and
// coalesce with both neighbours on free.
//
// The allocator also backs Rust's `alloc` crate (Box, Vec, ...) through
// `GlobalAlloc`. Allocation failure returns null; strict callers use
// `allocate_strict`.
// =============================================================================

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use ksync::SpinLock;

use crate::memory::address::{VirtAddr, PAGE_SIZE};
use crate::memory::vmm::AddressSpace;

/// Base of the kernel heap's virtual range.
pub const KHEAP_BASE: u64 = 0xFFFF_A000_0000_0000;

/// Size of the heap range: 16 MiB.
pub const KHEAP_SIZE: u64 = 16 * 1024 * 1024;

/// Allocation granule; sizes round up to this.
const GRANULE: usize = 16;

/// A split only happens when the remainder can hold a header plus this
/// much payload.
const MIN_SPLIT_PAYLOAD: usize = 32;

/// Magic tag of a free node.
const MAGIC_FREE: u64 = 0x4652_4545_4E4F_4445; // "FREENODE"
/// Magic tag of an allocated node.
const MAGIC_ALLOC: u64 = 0x414C_4C4F_434E_4F44; // "ALLOCNOD"

/// The "great fit" early-exit factor: a free node this many times the
/// request is taken immediately. Externally tunable.
static GREAT_FIT_FACTOR: AtomicUsize = AtomicUsize::new(16);

/// Heap usage snapshot.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub allocated_bytes: usize,
    pub node_count: usize,
}

/// Node header preceding every payload.
#[repr(C)]
struct Node {
    magic: u64,
    prev: *mut Node,
    next: *mut Node,
    /// Payload bytes following this header.
    size: usize,
}

const HEADER: usize = core::mem::size_of::<Node>();

struct Heap {
    head: *mut Node,
    start: usize,
    end: usize,
    allocated_bytes: usize,
}

// SAFETY: the node pointers are only dereferenced under the heap lock.
unsafe impl Send for Heap {}

impl Heap {
    const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            start: 0,
            end: 0,
            allocated_bytes: 0,
        }
    }

    /// Carve the whole range into one free node.
    fn init(&mut self, start: usize, size: usize) {
        self.start = start;
        self.end = start + size;
        self.allocated_bytes = 0;

        let node = start as *mut Node;
        // SAFETY: the range is mapped (demand pages) and ours alone.
        unsafe {
            (*node).magic = MAGIC_FREE;
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();
            (*node).size = size - HEADER;
        }
        self.head = node;
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = size.max(GRANULE).div_ceil(GRANULE) * GRANULE;
        let great = size.saturating_mul(GREAT_FIT_FACTOR.load(Ordering::Relaxed));

        // Best-fit walk with a great-fit early exit.
        let mut best: *mut Node = ptr::null_mut();
        let mut cursor = self.head;
        // SAFETY: chain nodes live inside the heap range; we hold the
        // lock.
        unsafe {
            while !cursor.is_null() {
                if (*cursor).magic == MAGIC_FREE && (*cursor).size >= size {
                    if (*cursor).size >= great {
                        best = cursor;
                        break;
                    }
                    if best.is_null() || (*cursor).size < (*best).size {
                        best = cursor;
                    }
                }
                cursor = (*cursor).next;
            }

            if best.is_null() {
                return ptr::null_mut();
            }

            // Split when the tail can host a node of its own.
            let remainder = (*best).size - size;
            if remainder >= HEADER + MIN_SPLIT_PAYLOAD {
                let tail = (best as usize + HEADER + size) as *mut Node;
                (*tail).magic = MAGIC_FREE;
                (*tail).size = remainder - HEADER;
                (*tail).prev = best;
                (*tail).next = (*best).next;
                if !(*tail).next.is_null() {
                    (*(*tail).next).prev = tail;
                }
                (*best).next = tail;
                (*best).size = size;
            }

            (*best).magic = MAGIC_ALLOC;
            self.allocated_bytes += (*best).size;

            (best as *mut u8).add(HEADER)
        }
    }

    fn free(&mut self, payload: *mut u8) {
        let node = (payload as usize - HEADER) as *mut Node;

        if (node as usize) < self.start || node as usize >= self.end {
            klog::error!("[heap] free of pointer outside the heap: {:p}", payload);
            return;
        }

        // SAFETY: bounds-checked above; the chain is lock-protected.
        unsafe {
            if (*node).magic != MAGIC_ALLOC {
                klog::error!(
                    "[heap] double free or corruption at {:p} (magic {:#018X})",
                    payload,
                    (*node).magic
                );
                return;
            }

            (*node).magic = MAGIC_FREE;
            self.allocated_bytes -= (*node).size;

            // Coalesce forward: absorb a free successor that is
            // physically adjacent.
            let next = (*node).next;
            if !next.is_null()
                && (*next).magic == MAGIC_FREE
                && node as usize + HEADER + (*node).size == next as usize
            {
                (*node).size += HEADER + (*next).size;
                (*node).next = (*next).next;
                if !(*node).next.is_null() {
                    (*(*node).next).prev = node;
                }
            }

            // Coalesce backward: let a free predecessor absorb us.
            let prev = (*node).prev;
            if !prev.is_null()
                && (*prev).magic == MAGIC_FREE
                && prev as usize + HEADER + (*prev).size == node as usize
            {
                (*prev).size += HEADER + (*node).size;
                (*prev).next = (*node).next;
                if !(*prev).next.is_null() {
                    (*(*prev).next).prev = prev;
                }
            }
        }
    }

    fn stats(&self) -> HeapStats {
        let mut node_count = 0;
        let mut cursor = self.head;
        // SAFETY: chain nodes live inside the heap range.
        unsafe {
            while !cursor.is_null() {
                node_count += 1;
                cursor = (*cursor).next;
            }
        }
        HeapStats {
            total_bytes: (self.end - self.start) as usize,
            allocated_bytes: self.allocated_bytes,
            node_count,
        }
    }
}

static HEAP: SpinLock<Heap> = SpinLock::new(Heap::empty());

/// Guards against a second initialization.
static HEAP_INIT: spin::Once<()> = spin::Once::new();

/// Map the heap range into the current address space (demand pages) and
/// thread the initial free node through it.
///
/// BSP only, once, after the PMM is up and the page fault handler is
/// wired (first touch of the range faults).
pub fn init() {
    HEAP_INIT.call_once(|| {
        let mut space = AddressSpace::from_cr3();

        let mut va = KHEAP_BASE;
        while va < KHEAP_BASE + KHEAP_SIZE {
            if !space.map_page(VirtAddr::new(va), true, false, true) {
                panic!("out of physical memory while mapping the kernel heap");
            }
            va += PAGE_SIZE;
        }

        HEAP.lock().init(KHEAP_BASE as usize, KHEAP_SIZE as usize);

        klog::info!(
            "[heap] {} MiB at {:#018X} (demand-paged)",
            KHEAP_SIZE / 1024 / 1024,
            KHEAP_BASE
        );
    });
}

/// Allocate `size` bytes, 16-byte aligned. Null when the heap is full.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    HEAP.lock().alloc(size)
}

/// Allocate or panic; for callers with no recovery path.
#[allow(dead_code)]
pub fn allocate_strict(size: usize) -> *mut u8 {
    let p = allocate(size);
    if p.is_null() {
        panic!("kernel heap exhausted allocating {} bytes", size);
    }
    p
}

/// Return `payload` to the heap. Bad pointers and double frees are
/// logged and ignored.
pub fn free(payload: *mut u8) {
    if payload.is_null() {
        return;
    }
    HEAP.lock().free(payload);
}

/// Usage snapshot.
pub fn stats() -> HeapStats {
    HEAP.lock().stats()
}

/// Tune the great-fit early-exit factor.
#[allow(dead_code)]
pub fn set_great_fit_factor(factor: usize) {
    GREAT_FIT_FACTOR.store(factor.max(1), Ordering::Relaxed);
}

/// The global allocator wiring `alloc` types to the kernel heap.
pub struct KernelAllocator;

// SAFETY: alloc/dealloc are lock-protected and return unique, live
// blocks of at least the requested size.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE {
            // Nothing in the kernel asks for more than 16-byte
            // alignment; refuse rather than hand out a misaligned block.
            klog::error!("[heap] unsupported alignment {}", layout.align());
            return ptr::null_mut();
        }
        allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
