//! The eternal heap: a process-lifetime bump allocator.
//!
//! A static 2 MiB arena handed out in 16-byte-aligned slices during
//! bring-up, before the kernel heap exists. Per-CPU state blocks, their
//! interrupt stacks and the PMM's region records live here. There is no
//! free path; everything allocated here lives as long as the kernel.

use core::cell::UnsafeCell;

use ksync::SpinLock;

/// Arena size. Generous for what goes here: a few KiB per CPU plus one
/// region record per usable memory range.
const ETERNAL_HEAP_SIZE: usize = 2 * 1024 * 1024;

/// Allocation granule; every request is rounded up to this.
const ALIGN: usize = 16;

#[repr(C, align(16))]
struct Arena(UnsafeCell<[u8; ETERNAL_HEAP_SIZE]>);

// SAFETY: slices are handed out exactly once each, under BUMP's lock.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; ETERNAL_HEAP_SIZE]));

/// Bytes handed out so far.
static BUMP: SpinLock<usize> = SpinLock::new(0);

/// Allocate `size` bytes from the eternal heap.
///
/// The memory is zeroed (the arena sits in .bss and is never recycled)
/// and 16-byte aligned. Returns `None` when the arena is exhausted;
/// bring-up callers treat that as fatal.
pub fn allocate(size: usize) -> Option<*mut u8> {
    let size = (size + ALIGN - 1) & !(ALIGN - 1);
    let mut bump = BUMP.lock();

    if *bump + size > ETERNAL_HEAP_SIZE {
        klog::error!(
            "eternal heap exhausted: {} in use, {} requested",
            *bump,
            size
        );
        return None;
    }

    let offset = *bump;
    *bump += size;

    // SAFETY: the range [offset, offset+size) was never handed out
    // before and never will be again.
    Some(unsafe { (ARENA.0.get() as *mut u8).add(offset) })
}

/// Bytes currently in use, for boot diagnostics.
pub fn used_bytes() -> usize {
    *BUMP.lock()
}
