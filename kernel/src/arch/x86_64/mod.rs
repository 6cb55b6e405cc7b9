//! x86_64 architecture layer.
//!
//! Everything hardware-shaped that is not a device driver lives here:
//! the Limine boot interface, privileged instruction wrappers, the
//! per-CPU descriptor tables, the interrupt entry plumbing and SMP
//! bring-up. Device access (serial, timers, APIC registers) is in the
//! `khal` crate.

pub mod boot;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod smp;
pub mod tss;
