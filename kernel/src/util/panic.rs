// =============================================================================
// AsterOS - Kernel Panic Handler
// =============================================================================
//
// A panic is a kernel bug: a violated invariant, an impossible state, a
// fatal fault. The machine must stop - all of it, not just the CPU that
// noticed.
//
// Protocol:
//   1. Try the process-wide panic lock. Losing the race means another
//      CPU is already tearing the system down; halt and wait for its
//      Panic IPI.
//   2. Send every other CPU a Panic IPI and wait until the halted-CPU
//      counter covers the machine.
//   3. Break the serial lock open (the panicking context may have held
//      it) and print the banner.
//   4. Idle forever.
// =============================================================================

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU32, Ordering};

use ksync::RawSpinLock;

use crate::arch::x86_64::{cpu, smp};
use crate::{kprint, kprintln};

/// Only one CPU gets to run the panic protocol.
static PANIC_LOCK: RawSpinLock = RawSpinLock::new();

/// CPUs that have stopped for good (the panicking one included).
static PANICKED_CPUS: AtomicU32 = AtomicU32::new(0);

/// How many CPUs have halted; boot scenarios assert this stays zero.
pub fn panicked_cpus() -> u32 {
    PANICKED_CPUS.load(Ordering::SeqCst)
}

/// Called by the Panic-IPI receiver just before it parks itself.
pub fn note_cpu_halted() {
    PANICKED_CPUS.fetch_add(1, Ordering::SeqCst);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if !PANIC_LOCK.try_lock() {
        // Someone else is already panicking; wait for their Panic IPI
        // to halt us (interrupts stay as they are).
        loop {
            cpu::halt();
        }
    }

    PANICKED_CPUS.fetch_add(1, Ordering::SeqCst);

    // Quiesce every other CPU before touching the console.
    let cpu_count = smp::cpu_count();
    if smp::ipi_ready() && cpu_count > 1 {
        let me = smp::PerCpu::current().processor_id;
        for i in 0..cpu_count {
            let other = smp::cpu_by_index(i);
            if other.processor_id != me {
                other.send_ipi(smp::IpiKind::Panic);
            }
        }

        while PANICKED_CPUS.load(Ordering::SeqCst) < cpu_count {
            core::hint::spin_loop();
        }
    }

    // All other CPUs are parked; if the panicking context died inside
    // the serial writer, the lock is wedged. Break it.
    // SAFETY: no other CPU runs anymore.
    unsafe {
        khal::serial::force_unlock();
    }

    kprintln!();
    kprintln!("==========================================================");
    if smp::ipi_ready() {
        kprintln!(
            "  KERNEL PANIC - AsterOS (CPU {})",
            smp::PerCpu::current().processor_id
        );
    } else {
        kprintln!("  KERNEL PANIC - AsterOS (early boot)");
    }
    kprintln!("==========================================================");

    if let Some(location) = info.location() {
        kprintln!("  Location: {}:{}", location.file(), location.line());
    } else {
        kprintln!("  Location: <unknown>");
    }
    kprintln!("  Message:  {}", info.message());

    kprint!("==========================================================\n");
    kprintln!("  System halted. Reboot required.");
    kprintln!("==========================================================");

    cpu::halt_forever()
}
