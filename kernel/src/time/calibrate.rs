// =============================================================================
// AsterOS - Timer Calibration
// =============================================================================
//
// Measures two per-CPU rates against the polled reference clock:
//
//   - local APIC timer ticks per millisecond (divider 16), and
//   - TSC ticks per millisecond.
//
// Sixteen runs of a nominal 20 ms sleep each. The APIC timer counts down
// from 0xFFFF_FFFF across the sleep, is masked, and the consumed count is
// read back. With the HPET as reference, both deltas are rescaled by the
// ticks the HPET actually advanced, which corrects for preemption and
// SMI jitter inside a run.
//
// After every CPU has calibrated, the BSP averages the rates; when all
// CPUs sit within ±1000 ticks/ms of the average, each CPU's rate is
// replaced by it, unifying the time base across the machine.
// =============================================================================

use crate::arch::x86_64::smp;
use crate::time::{self, RefClock, NANOS_PER_MILLI};

/// Calibration runs per CPU.
const RUNS: u64 = 16;

/// Nominal sleep per run, in milliseconds.
const MS_PER_RUN: u64 = 20;

/// Maximum distance from the average (ticks/ms) for rate unification.
const UNIFY_TOLERANCE: u64 = 1000;

/// Measure the calling CPU's APIC-timer and TSC rates.
///
/// Returns `(lapic_ticks_per_ms, tsc_ticks_per_ms)`.
pub fn calibrate_timer() -> (u64, u64) {
    khal::apic::set_timer_divider(khal::apic::TimerDivide::By16);

    match time::reference() {
        RefClock::Hpet => calibrate_against_hpet(),
        RefClock::Pit => calibrate_against_pit(),
    }
}

fn calibrate_against_pit() -> (u64, u64) {
    let mut apic_total: u64 = 0;
    let mut tsc_total: u64 = 0;

    for _ in 0..RUNS {
        let tsc_start = khal::tsc::read();

        khal::apic::start_countdown(0xFFFF_FFFF);
        khal::pit::polled_sleep(MS_PER_RUN * NANOS_PER_MILLI);

        let tsc_delta = khal::tsc::read() - tsc_start;
        let apic_delta = khal::apic::stop_countdown() as u64;

        apic_total += apic_delta;
        tsc_total += tsc_delta;
    }

    (apic_total / (RUNS * MS_PER_RUN), tsc_total / (RUNS * MS_PER_RUN))
}

fn calibrate_against_hpet() -> (u64, u64) {
    let mut apic_total: u64 = 0;
    let mut tsc_total: u64 = 0;

    // The nominal sleep, expressed in HPET ticks.
    let sleep_ticks =
        MS_PER_RUN * NANOS_PER_MILLI * khal::hpet::FEMTOS_PER_NANO / khal::hpet::counter_clock_period();

    for _ in 0..RUNS {
        khal::apic::start_countdown(0xFFFF_FFFF);

        let tsc_then = khal::tsc::read();
        let hpet_then = khal::hpet::raw_ticks();
        let target = hpet_then + sleep_ticks;

        while khal::hpet::raw_ticks() < target {
            core::hint::spin_loop();
        }

        let apic_delta = khal::apic::stop_countdown() as u64;
        let tsc_now = khal::tsc::read();
        let hpet_now = khal::hpet::raw_ticks();

        let tsc_delta = tsc_now - tsc_then;
        let hpet_delta = (hpet_now - hpet_then).max(1);

        // Rescale by the ticks the HPET actually advanced.
        let tsc_delta = (tsc_delta as u128 * sleep_ticks as u128 / hpet_delta as u128) as u64;
        let apic_delta = (apic_delta as u128 * sleep_ticks as u128 / hpet_delta as u128) as u64;

        apic_total += apic_delta;
        tsc_total += tsc_delta;
    }

    (apic_total / (RUNS * MS_PER_RUN), tsc_total / (RUNS * MS_PER_RUN))
}

/// Cross-CPU rate unification, run once by the BSP after every CPU has
/// published its rates.
///
/// Each rate family (APIC, TSC) is averaged separately; only when every
/// CPU lies within the tolerance of the average is the average written
/// back to all of them.
pub fn unify_rates() {
    let count = smp::cpu_count() as u64;
    if count == 0 {
        return;
    }

    let mut apic_sum: u64 = 0;
    let mut tsc_sum: u64 = 0;
    for i in 0..smp::cpu_count() {
        let cpu = smp::cpu_by_index(i);
        apic_sum += cpu.lapic_ticks_per_ms;
        tsc_sum += cpu.tsc_ticks_per_ms;
    }
    let apic_avg = apic_sum / count;
    let tsc_avg = tsc_sum / count;

    let mut coherent = true;
    for i in 0..smp::cpu_count() {
        let cpu = smp::cpu_by_index(i);
        if cpu.lapic_ticks_per_ms.abs_diff(apic_avg) > UNIFY_TOLERANCE
            || cpu.tsc_ticks_per_ms.abs_diff(tsc_avg) > UNIFY_TOLERANCE
        {
            coherent = false;
            break;
        }
    }

    if coherent {
        for i in 0..smp::cpu_count() {
            let cpu = smp::cpu_by_index(i);
            cpu.lapic_ticks_per_ms = apic_avg;
            cpu.tsc_ticks_per_ms = tsc_avg;
        }
        klog::info!(
            "[time] unified rates: {} APIC ticks/ms, {} TSC ticks/ms",
            apic_avg,
            tsc_avg
        );
    } else {
        klog::warn!(
            "[time] per-CPU rates too far apart to unify (avg {} APIC, {} TSC)",
            apic_avg,
            tsc_avg
        );
    }
}
