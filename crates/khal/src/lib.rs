//! Hardware Abstraction Layer.
//!
//! Everything in this crate talks to a device or a model-specific
//! register directly: port I/O, the COM1 UART, the legacy timers (PIT,
//! HPET), the local APIC and the timestamp counter. Policy - what to do
//! with these devices - lives in the kernel; this crate only knows how
//! to poke them.
#![no_std]

pub mod apic;
pub mod hpet;
pub mod pic;
pub mod pit;
pub mod port;
pub mod serial;
pub mod tsc;
