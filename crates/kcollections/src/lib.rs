//! Heap-ordered containers for the scheduler.
//!
//! Two binary heaps over `alloc::vec::Vec`:
//!
//! - [`PriorityQueue`]: pops the entry with the *largest* key; entries
//!   with equal keys pop in insertion order (FIFO). The run queue uses
//!   this with thread priorities as keys.
//! - [`MinHeap`]: pops the entry with the *smallest* key. The sleep
//!   queue uses this with absolute wake deadlines as keys.
//!
//! Both are `no_std + alloc`; the unit tests run on the host.
#![no_std]

extern crate alloc;

mod min_heap;
mod priority_queue;

pub use min_heap::MinHeap;
pub use priority_queue::PriorityQueue;
