// =============================================================================
// AsterOS - Memory Subsystem
// =============================================================================
//
// Layered bottom-up:
//
//   address.rs  - PhysAddr/VirtAddr newtypes and the HHDM offset
//   eternal.rs  - boot-lifetime bump allocator (never frees)
//   pmm.rs      - physical frame allocator (per-region free lists)
//   vmm.rs      - page tables, address spaces, demand-page faults
//   heap.rs     - kernel heap (first-fit free list, GlobalAlloc)
// =============================================================================

pub mod address;
pub mod eternal;
pub mod heap;
pub mod pmm;
pub mod vmm;
