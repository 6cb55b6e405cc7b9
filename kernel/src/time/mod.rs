// =============================================================================
// AsterOS - Timing
// =============================================================================
//
// Three layers:
//
//   1. The polled reference clock - PIT by default, HPET once discovered.
//      Only used for calibration-grade busy sleeps.
//   2. The monotonic clock - nanoseconds since the steady-state barrier,
//      derived from the TSC and the per-CPU calibration constants (an
//      HPET-based time base exists as an alternative).
//   3. One-shot deadline programming of the local APIC timer, in
//      nanoseconds, for the scheduler.
// =============================================================================

pub mod calibrate;

use ksync::SpinLock;

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::interrupts::APIC_TIMER_VECTOR;
use crate::arch::x86_64::smp::PerCpu;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// The polled-sleep back-end. PIT until the ACPI walk finds and verifies
/// an HPET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefClock {
    Pit,
    Hpet,
}

/// Which counter backs the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    /// Per-CPU TSC against the calibrated rate (default).
    Tsc,
    /// The HPET main counter.
    Hpet,
}

/// The reference clock selector. Its own lock, per the shared-resource
/// discipline; reads copy the value out before sleeping.
static REF_CLOCK: SpinLock<RefClock> = SpinLock::new(RefClock::Pit);

/// The monotonic time base selector.
static TIME_BASE: SpinLock<TimeBase> = SpinLock::new(TimeBase::Tsc);

/// Promote the HPET to reference clock. Called once by the BSP after the
/// HPET passes its sanity check.
pub fn select_hpet() {
    *REF_CLOCK.lock() = RefClock::Hpet;
    klog::info!("[time] HPET selected as polled-sleep reference");
}

/// The active reference clock.
pub fn reference() -> RefClock {
    *REF_CLOCK.lock()
}

/// Switch the monotonic clock to the HPET counter.
#[allow(dead_code)]
pub fn select_hpet_time_base() {
    *TIME_BASE.lock() = TimeBase::Hpet;
}

/// Busy-wait for `ns` nanoseconds on the reference clock.
pub fn sleep_ns(ns: u64) {
    match reference() {
        RefClock::Pit => khal::pit::polled_sleep(ns),
        RefClock::Hpet => khal::hpet::polled_sleep(ns),
    }
}

/// Raw ticks of the reference clock, for calibration users.
#[allow(dead_code)]
pub fn raw_ticks() -> u64 {
    match reference() {
        RefClock::Pit => khal::pit::read() as u64,
        RefClock::Hpet => khal::hpet::raw_ticks(),
    }
}

/// Monotonic nanoseconds since the steady-state barrier.
///
/// Returns 0 before calibration finishes; the scheduler only runs after.
pub fn tick_count_ns() -> u64 {
    match *TIME_BASE.lock() {
        TimeBase::Tsc => {
            let cpu = PerCpu::current();
            if cpu.tsc_ticks_per_ms == 0 {
                return 0;
            }
            let elapsed = khal::tsc::read().wrapping_sub(cpu.starting_tsc);
            (elapsed as u128 * NANOS_PER_MILLI as u128 / cpu.tsc_ticks_per_ms as u128) as u64
        }
        TimeBase::Hpet => {
            (khal::hpet::raw_ticks() as u128 * khal::hpet::counter_clock_period() as u128
                / khal::hpet::FEMTOS_PER_NANO as u128) as u64
        }
    }
}

/// Program the local APIC timer to fire in `ns` nanoseconds, one-shot,
/// on the scheduler vector.
///
/// Must be called with interrupts disabled: the countdown starts
/// immediately and a short deadline could otherwise fire mid-update.
pub fn schedule_interrupt_in(ns: u64) {
    debug_assert!(!cpu::interrupts_enabled());

    let cpu = PerCpu::current();
    let ticks = (ns as u128 * cpu.lapic_ticks_per_ms as u128 / NANOS_PER_MILLI as u128) as u64;
    // A zero count would disarm the timer instead of firing.
    let ticks = ticks.clamp(1, u32::MAX as u64) as u32;

    khal::apic::arm_oneshot(APIC_TIMER_VECTOR, ticks);
}
