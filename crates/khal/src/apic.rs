//! Local APIC (Advanced Programmable Interrupt Controller) driver.
//!
//! Every CPU carries its own local APIC. This module covers the three
//! things the kernel needs from it: interrupt acceptance (spurious
//! vector, EOI), the local timer (divider, one-shot programming, the
//! masked stop-and-read used by calibration) and inter-processor
//! interrupts through the interrupt command register pair.
//!
//! The register block is memory-mapped at physical 0xFEE0_0000 and is
//! accessed through the higher-half direct map; [`init`] records the
//! virtual base once the HHDM offset is known.

use core::sync::atomic::{AtomicU64, Ordering};

/// Physical base of the local APIC register block.
const LAPIC_BASE_PHYS: u64 = 0xFEE0_0000;

/// IA32_APIC_BASE model specific register.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE: global APIC enable.
const APIC_BASE_ENABLE: u64 = 1 << 11;

// --- Register offsets from the APIC base ---

const APIC_REG_ID: u32 = 0x020;
const APIC_REG_EOI: u32 = 0x0B0;
const APIC_REG_SPURIOUS: u32 = 0x0F0;
const APIC_REG_ICR0: u32 = 0x300;
const APIC_REG_ICR1: u32 = 0x310;
const APIC_REG_LVT_TIMER: u32 = 0x320;
const APIC_REG_TMR_INIT_CNT: u32 = 0x380;
const APIC_REG_TMR_CURR_CNT: u32 = 0x390;
const APIC_REG_TMR_DIV_CFG: u32 = 0x3E0;
const APIC_REG_TASK_PRIORITY: u32 = 0x080;

/// SVR bit 8: software enable.
const SVR_APIC_ENABLE: u32 = 1 << 8;

/// LVT bit 16: masked.
const APIC_LVT_INT_MASKED: u32 = 1 << 16;

/// ICR0 bit 12: delivery status (send pending).
const APIC_ICR0_DELIVERY_STATUS: u32 = 1 << 12;

/// ICR0 bits 18-19: destination shorthand "no shorthand" (single target).
const APIC_ICR0_SINGLE: u32 = 0 << 18;

/// One-shot timer mode (bits 17-18 of the LVT timer register).
const APIC_TIMER_MODE_ONESHOT: u32 = 0b00 << 17;

/// Timer divide configuration values. Bit 2 of the encoding is reserved.
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum TimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

/// Virtual base of the register block; 0 until [`init`] runs.
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    (high as u64) << 32 | low as u64
}

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") low,
            in("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Read a 32-bit APIC register.
#[inline]
fn read_reg(offset: u32) -> u32 {
    let base = APIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC accessed before init");
    unsafe { core::ptr::read_volatile((base + offset as u64) as *const u32) }
}

/// Write a 32-bit APIC register.
#[inline]
fn write_reg(offset: u32, value: u32) {
    let base = APIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC accessed before init");
    unsafe {
        core::ptr::write_volatile((base + offset as u64) as *mut u32, value);
    }
}

/// Check via CPUID that an APIC is present at all.
pub fn is_present() -> bool {
    let edx: u32;
    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "pop rbx",
            inout("eax") 1_u32 => _,
            out("ecx") _,
            out("edx") edx,
        );
    }
    edx & (1 << 9) != 0
}

/// Initialize and software-enable the local APIC of the calling CPU.
///
/// Records the HHDM-mapped register base (first caller), sets the global
/// enable bit in IA32_APIC_BASE if it was cleared, programs the spurious
/// vector with the software-enable bit, and opens the task priority
/// register to all interrupt levels.
///
/// Returns the APIC ID of the calling CPU.
pub fn init(hhdm_offset: u64, spurious_vector: u8) -> u32 {
    APIC_BASE.store(hhdm_offset + LAPIC_BASE_PHYS, Ordering::Relaxed);

    unsafe {
        let msr = rdmsr(IA32_APIC_BASE_MSR);
        if msr & APIC_BASE_ENABLE == 0 {
            wrmsr(IA32_APIC_BASE_MSR, msr | APIC_BASE_ENABLE);
        }
    }

    write_reg(
        APIC_REG_SPURIOUS,
        SVR_APIC_ENABLE | spurious_vector as u32,
    );
    write_reg(APIC_REG_TASK_PRIORITY, 0);

    read_reg(APIC_REG_ID) >> 24
}

/// Signal end-of-interrupt for the in-service interrupt.
#[inline]
pub fn eoi() {
    write_reg(APIC_REG_EOI, 0);
}

/// The APIC ID of the calling CPU.
pub fn lapic_id() -> u32 {
    read_reg(APIC_REG_ID) >> 24
}

/// Spin until the previous IPI has left the local send queue.
pub fn wait_delivery_idle() {
    while read_reg(APIC_REG_ICR0) & APIC_ICR0_DELIVERY_STATUS != 0 {
        core::hint::spin_loop();
    }
}

/// Fire `vector` at the CPU whose local APIC has `dest_lapic_id`.
///
/// The ICR1 write selects the destination; the ICR0 write carries the
/// vector and triggers delivery, and doubles as the ordering barrier for
/// whatever mailbox state the sender published beforehand.
pub fn send_ipi(dest_lapic_id: u32, vector: u8) {
    write_reg(APIC_REG_ICR1, dest_lapic_id << 24);
    write_reg(APIC_REG_ICR0, vector as u32 | APIC_ICR0_SINGLE);
}

/// Program the timer divide configuration.
pub fn set_timer_divider(divide: TimerDivide) {
    write_reg(APIC_REG_TMR_DIV_CFG, divide as u32);
}

/// Start the timer counting down from `initial`, leaving the LVT alone.
/// Calibration uses this with the LVT masked.
pub fn start_countdown(initial: u32) {
    write_reg(APIC_REG_TMR_INIT_CNT, initial);
}

/// Mask the timer and return how far the countdown got.
pub fn stop_countdown() -> u32 {
    write_reg(APIC_REG_LVT_TIMER, APIC_LVT_INT_MASKED);
    0xFFFF_FFFF - read_reg(APIC_REG_TMR_CURR_CNT)
}

/// Arm a one-shot timer interrupt on `vector` after `count` timer ticks.
///
/// The caller must run with interrupts disabled; the interrupt fires as
/// soon as the countdown ends.
pub fn arm_oneshot(vector: u8, count: u32) {
    write_reg(APIC_REG_TMR_INIT_CNT, count);
    write_reg(
        APIC_REG_LVT_TIMER,
        vector as u32 | APIC_TIMER_MODE_ONESHOT,
    );
}

/// Mask the timer LVT entry without reading the count.
pub fn mask_timer() {
    write_reg(APIC_REG_LVT_TIMER, APIC_LVT_INT_MASKED);
}
