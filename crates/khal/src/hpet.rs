//! High Precision Event Timer register access.
//!
//! The HPET is the preferred calibration reference when ACPI reports
//! one: a single platform-wide counter with a femtosecond-granularity
//! period published in its capabilities register. The kernel discovers
//! the table, maps the register page cache-disabled, and hands the
//! virtual base to [`install`]; everything here is then plain volatile
//! MMIO.

use core::sync::atomic::{AtomicU64, Ordering};

/// General capabilities and ID register.
const REG_GENERAL_CAPS: u64 = 0x000;
/// General configuration register.
const REG_GENERAL_CONFIG: u64 = 0x010;
/// Main counter value register.
const REG_MAIN_COUNTER: u64 = 0x0F0;

/// General configuration bit 0: overall enable. Must be set for the main
/// counter to run.
const GEN_CFG_ENABLE: u64 = 1 << 0;

/// Femtoseconds per nanosecond.
pub const FEMTOS_PER_NANO: u64 = 1_000_000;

/// The HPET specification caps the period at 100 ns (0x05F5E100
/// femtoseconds).
pub const MAX_PERIOD_FS: u64 = 100_000_000;

/// Virtual base of the mapped register page; 0 until installed.
static HPET_BASE: AtomicU64 = AtomicU64::new(0);

#[inline]
fn read_reg(offset: u64) -> u64 {
    let base = HPET_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "HPET accessed before install");
    unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
}

#[inline]
fn write_reg(offset: u64, value: u64) {
    let base = HPET_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "HPET accessed before install");
    unsafe {
        core::ptr::write_volatile((base + offset) as *mut u64, value);
    }
}

/// Record the virtual base of the HPET register page.
///
/// # Safety
/// `base_virt` must map the HPET register block read/write and
/// cache-disabled for the rest of the kernel's lifetime.
pub unsafe fn install(base_virt: u64) {
    HPET_BASE.store(base_virt, Ordering::Release);
}

/// `true` once [`install`] has run.
pub fn is_installed() -> bool {
    HPET_BASE.load(Ordering::Acquire) != 0
}

/// The raw general-capabilities register.
pub fn general_caps() -> u64 {
    read_reg(REG_GENERAL_CAPS)
}

/// Main counter period in femtoseconds per tick (caps bits 63:32).
pub fn counter_clock_period() -> u64 {
    general_caps() >> 32
}

/// `true` when the counter is 64 bits wide (caps bit 13).
pub fn is_64bit() -> bool {
    general_caps() & (1 << 13) != 0
}

/// Reset and enable the main counter.
pub fn enable() {
    write_reg(REG_GENERAL_CONFIG, 0);
    write_reg(REG_MAIN_COUNTER, 0);
    write_reg(REG_GENERAL_CONFIG, GEN_CFG_ENABLE);
}

/// The main counter value. This is a bus access, noticeably slower than
/// a TSC read.
pub fn raw_ticks() -> u64 {
    read_reg(REG_MAIN_COUNTER)
}

/// Busy-wait for `ns` nanoseconds against the main counter.
pub fn polled_sleep(ns: u64) {
    let ticks = ns * FEMTOS_PER_NANO / counter_clock_period();
    let target = raw_ticks() + ticks;
    while raw_ticks() < target {
        core::hint::spin_loop();
    }
}
