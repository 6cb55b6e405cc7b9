// =============================================================================
// AsterOS - Per-CPU State and SMP Bring-up
// =============================================================================
//
// One `PerCpu` block per logical processor, allocated by the BSP in the
// eternal heap and published through the Limine SMP descriptor's `extra`
// slot. Each CPU points IA32_GS_BASE at its own block, so `current()` is
// one GS-relative load.
//
// Bring-up: the BSP creates every block, releases the APs by writing the
// trampoline into `goto_address` (SeqCst), and runs the same per-CPU
// init path itself. The APs gate on the BSP-initialized flag so every
// BSP-only global (kernel heap, ACPI walk, PIC mask-out) is finished
// before they proceed. After calibration the BSP unifies the timer
// rates; then every CPU passes one barrier, samples its starting TSC,
// and drops into its scheduler for good.
//
// The IPI mailbox protocol: the sender spins until the target APIC's
// delivery status clears, takes the target's `ipi_lock`, deposits kind
// and sender, and fires the vector. The receiver reads the mailbox,
// EOIs, and releases the lock.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use ksync::RawSpinLock;

use super::boot;
use super::cpu;
use super::gdt::{Gdt, Selectors};
use super::idt::Idt;
use super::interrupts::{self, IPI_VECTOR, SPURIOUS_VECTOR};
use super::tss::Tss;
use crate::memory::{eternal, heap, pmm, vmm::AddressSpace};
use crate::sched::scheduler::{self, Scheduler};
use crate::time::calibrate;
use crate::{acpi, util};

/// Size of each CPU's interrupt stack.
const ISR_STACK_SIZE: usize = 8 * 1024;

/// What an inter-processor interrupt asks of its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiKind {
    None = 0,
    /// Diagnostic: log and carry on.
    Hello = 1,
    /// System-wide halt; the receiver parks forever.
    Panic = 2,
}

impl IpiKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => IpiKind::Hello,
            2 => IpiKind::Panic,
            _ => IpiKind::None,
        }
    }
}

/// Everything a CPU owns. Lives in the eternal heap, never moves, never
/// dies.
#[repr(C)]
pub struct PerCpu {
    /// Must stay the first field: `current()` reads it from `gs:[0]`.
    self_ptr: *const PerCpu,

    pub processor_id: u32,
    pub lapic_id: u32,
    pub is_bsp: bool,
    pub smp_info: *const limine::mp::Cpu,

    pub gdt: Gdt,
    pub selectors: Selectors,
    pub tss: Tss,
    pub idt: Idt,
    pub isr_stack_top: u64,

    /// The address space this CPU runs on after bring-up.
    pub page_map: Option<AddressSpace>,
    /// Set once the kernel-heap PML4 slots were pre-allocated here.
    pub kheap_pml4_initted: bool,

    /// IPI mailbox, held under `ipi_lock` for the round trip.
    pub ipi_kind: AtomicU8,
    pub ipi_sender: AtomicU32,
    pub ipi_lock: RawSpinLock,

    pub scheduler: Scheduler,

    /// Mirror of this CPU's interrupt flag, readable from interrupt
    /// context.
    pub interrupts_enabled: bool,

    pub lapic_ticks_per_ms: u64,
    pub tsc_ticks_per_ms: u64,
    pub starting_tsc: u64,
}

impl PerCpu {
    fn new(processor_id: u32, lapic_id: u32, is_bsp: bool, smp_info: *const limine::mp::Cpu) -> Self {
        Self {
            self_ptr: core::ptr::null(),
            processor_id,
            lapic_id,
            is_bsp,
            smp_info,
            gdt: Gdt::zeroed(),
            selectors: Selectors::standard(),
            tss: Tss::new(),
            idt: Idt::new(),
            isr_stack_top: 0,
            page_map: None,
            kheap_pml4_initted: false,
            ipi_kind: AtomicU8::new(IpiKind::None as u8),
            ipi_sender: AtomicU32::new(0),
            ipi_lock: RawSpinLock::new(),
            scheduler: Scheduler::new(),
            interrupts_enabled: false,
            lapic_ticks_per_ms: 0,
            tsc_ticks_per_ms: 0,
            starting_tsc: 0,
        }
    }

    /// The calling CPU's block, via the GS base set during init.
    #[inline]
    pub fn current() -> &'static mut PerCpu {
        let ptr: *mut PerCpu;
        // SAFETY: gs:[0] holds self_ptr from the moment per-CPU init
        // wrote the GS base; nothing calls current() before that.
        unsafe {
            core::arch::asm!(
                "mov {}, gs:[0]",
                out(reg) ptr,
                options(nostack, preserves_flags)
            );
            &mut *ptr
        }
    }

    /// Send an IPI to this (target) CPU.
    ///
    /// Spins out any in-flight IPI on the sender's APIC first, then
    /// holds the target's mailbox lock across the delivery; the receiver
    /// releases it.
    pub fn send_ipi(&self, kind: IpiKind) {
        let sender = PerCpu::current().processor_id;

        khal::apic::wait_delivery_idle();

        self.ipi_lock.lock();
        self.ipi_kind.store(kind as u8, Ordering::SeqCst);
        self.ipi_sender.store(sender, Ordering::SeqCst);

        khal::apic::send_ipi(self.lapic_id, IPI_VECTOR);
        // The receiving CPU unlocks the mailbox.
    }
}

/// APs wait on this until the BSP has finished its global init.
static BSP_READY: AtomicBool = AtomicBool::new(false);

/// CPUs that have finished timer calibration.
static CPUS_CALIBRATED: AtomicU32 = AtomicU32::new(0);

/// Set once the BSP has unified (or given up unifying) the timer rates.
static RATES_UNIFIED: AtomicBool = AtomicBool::new(false);

/// CPUs that reached the steady-state barrier.
static CPUS_AT_BARRIER: AtomicU32 = AtomicU32::new(0);

/// Total logical processors.
static CPU_COUNT: AtomicU32 = AtomicU32::new(0);

/// Set once IPIs can be delivered (APICs programmed everywhere).
static IPI_READY: AtomicBool = AtomicBool::new(false);

/// Total logical processors, 0 before bring-up starts.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::SeqCst)
}

/// `true` once the panic path may broadcast IPIs.
pub fn ipi_ready() -> bool {
    IPI_READY.load(Ordering::SeqCst)
}

/// The block of processor `index`, via the SMP descriptor it was
/// published through.
pub fn cpu_by_index(index: u32) -> &'static mut PerCpu {
    let cpus = boot::mp_response().cpus();
    let ptr = cpus[index as usize].extra.load(Ordering::SeqCst) as *mut PerCpu;
    debug_assert!(!ptr.is_null());
    // SAFETY: start_all stored a valid eternal-heap pointer in every
    // descriptor before any CPU could run.
    unsafe { &mut *ptr }
}

/// Bring every processor up. BSP only; never returns.
pub fn start_all() -> ! {
    let resp = boot::mp_response();
    let cpus = resp.cpus();
    let bsp_lapic_id = resp.bsp_lapic_id();

    CPU_COUNT.store(cpus.len() as u32, Ordering::SeqCst);

    // Allocate and publish every CPU's block first, so `cpu_by_index`
    // works from the instant any CPU starts running.
    for (index, smp_cpu) in cpus.iter().enumerate() {
        let is_bsp = smp_cpu.lapic_id == bsp_lapic_id;

        let block = eternal::allocate(core::mem::size_of::<PerCpu>())
            .expect("eternal heap exhausted allocating per-CPU state")
            as *mut PerCpu;

        // SAFETY: fresh, aligned, correctly sized eternal allocation.
        unsafe {
            block.write(PerCpu::new(
                index as u32,
                smp_cpu.lapic_id,
                is_bsp,
                *smp_cpu as *const limine::mp::Cpu,
            ));
            (*block).self_ptr = block;
        }

        smp_cpu.extra.store(block as u64, Ordering::SeqCst);
    }

    // Release the APs into the trampoline; sequential consistency
    // orders the publication after the block stores above.
    for smp_cpu in cpus.iter() {
        if smp_cpu.lapic_id != bsp_lapic_id {
            smp_cpu.goto_address.write(ap_entry);
        }
    }

    // The BSP walks the same path itself.
    let me = cpus
        .iter()
        .find(|c| c.lapic_id == bsp_lapic_id)
        .expect("SMP response lists no BSP");
    let block = me.extra.load(Ordering::SeqCst) as *mut PerCpu;
    // SAFETY: just published above.
    cpu_main(unsafe { &mut *block })
}

/// Limine drops each AP here: paging on, interrupts off, temporary
/// stack.
extern "C" fn ap_entry(smp_cpu: &limine::mp::Cpu) -> ! {
    let block = smp_cpu.extra.load(Ordering::SeqCst) as *mut PerCpu;
    // SAFETY: the BSP published the block before writing goto_address.
    cpu_main(unsafe { &mut *block })
}

/// The per-CPU initialization path; every processor runs it exactly
/// once and never returns.
fn cpu_main(pcpu: &'static mut PerCpu) -> ! {
    // APs hold until the BSP's global init (heap, ACPI, PIC) is done.
    if !pcpu.is_bsp {
        while !BSP_READY.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    // 1. Interrupt stack; every privilege-transition slot points at it.
    let isr_stack = eternal::allocate(ISR_STACK_SIZE)
        .expect("eternal heap exhausted allocating an interrupt stack");
    pcpu.isr_stack_top = isr_stack as u64 + ISR_STACK_SIZE as u64;
    pcpu.tss.set_all_rsp(pcpu.isr_stack_top);

    // 2. GS base, so current() works from here on.
    // SAFETY: the block is eternal; the MSR write is this CPU's own.
    unsafe {
        cpu::write_msr(cpu::IA32_GS_BASE, pcpu.self_ptr as u64);
    }

    // 3. Descriptor tables.
    pcpu.gdt.init(&pcpu.tss);
    // SAFETY: GDT and TSS live in the eternal block and never move.
    unsafe {
        pcpu.gdt.load(&pcpu.selectors);
    }
    interrupts::install(&mut pcpu.idt, pcpu.selectors.kernel_code);
    // SAFETY: the IDT lives in the eternal block and never moves.
    unsafe {
        pcpu.idt.load();
    }

    // 4. Kernel heap (BSP only; the page fault handler is live now).
    if pcpu.is_bsp {
        heap::init();
        pmm::self_test();

        let hs = heap::stats();
        let ps = pmm::stats();
        klog::debug!(
            "[boot] heap {} KiB in {} nodes ({} B live); {} of {} pages free in {} regions; eternal {} KiB used",
            hs.total_bytes / 1024,
            hs.node_count,
            hs.allocated_bytes,
            ps.free_pages,
            ps.total_pages,
            ps.region_count,
            eternal::used_bytes() / 1024
        );
    }

    // 5. Leave the bootloader's lower-half mappings behind.
    let map = AddressSpace::from_cr3().clone_map(false);
    map.switch_to();
    pcpu.page_map = Some(map);
    klog::debug!(
        "[smp] CPU {} (ACPI id {}): page map root {}, interrupt stack top {:#X}",
        pcpu.processor_id,
        // SAFETY: the descriptor outlives the kernel; Limine built it.
        unsafe { (*pcpu.smp_info).id },
        map.root_phys(),
        pcpu.isr_stack_top
    );

    // 6. + 7. BSP walks ACPI (HPET discovery) and silences the PICs.
    if pcpu.is_bsp {
        acpi::init();
        khal::pic::disable();
    }

    let apic_id = khal::apic::init(crate::memory::address::hhdm_offset(), SPURIOUS_VECTOR);
    klog::debug!(
        "[smp] CPU {} online (LAPIC {}, {})",
        pcpu.processor_id,
        apic_id,
        if pcpu.is_bsp { "BSP" } else { "AP" }
    );

    // 8. Calibrate this CPU's timers against the reference clock.
    let (lapic_rate, tsc_rate) = calibrate::calibrate_timer();
    pcpu.lapic_ticks_per_ms = lapic_rate;
    pcpu.tsc_ticks_per_ms = tsc_rate;
    klog::debug!(
        "[smp] CPU {}: {} APIC ticks/ms, {} TSC ticks/ms",
        pcpu.processor_id,
        lapic_rate,
        tsc_rate
    );
    CPUS_CALIBRATED.fetch_add(1, Ordering::SeqCst);

    // 9. Scheduler, then the cross-CPU hand-off dance.
    pcpu.scheduler.init(pcpu.processor_id);

    if pcpu.is_bsp {
        scheduler::spawn_heartbeat();
        scheduler::spawn_lifecycle_check();

        // Release the APs, then wait for all of them to calibrate.
        BSP_READY.store(true, Ordering::Release);
        while CPUS_CALIBRATED.load(Ordering::SeqCst) < cpu_count() {
            core::hint::spin_loop();
        }

        calibrate::unify_rates();
        klog::debug!(
            "[smp] all {} CPUs calibrated; panicked CPUs: {}",
            cpu_count(),
            util::panic::panicked_cpus()
        );
        IPI_READY.store(true, Ordering::SeqCst);
        RATES_UNIFIED.store(true, Ordering::SeqCst);
    } else {
        while !RATES_UNIFIED.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
    }

    // The single synchronizing barrier: everyone samples its starting
    // TSC at (as close as it gets to) the same instant.
    CPUS_AT_BARRIER.fetch_add(1, Ordering::SeqCst);
    while CPUS_AT_BARRIER.load(Ordering::SeqCst) < cpu_count() {
        core::hint::spin_loop();
    }
    pcpu.starting_tsc = khal::tsc::read();

    // Say hello across the machine once, from the BSP.
    if pcpu.is_bsp {
        for i in 0..cpu_count() {
            let other = cpu_by_index(i);
            if other.processor_id != pcpu.processor_id {
                other.send_ipi(IpiKind::Hello);
            }
        }
    }

    klog::info!("[smp] CPU {} entering its scheduler", pcpu.processor_id);
    pcpu.interrupts_enabled = true;
    cpu::enable_interrupts();

    // From here the CPU belongs to its threads.
    pcpu.scheduler.enter()
}

/// The IPI receiver. Runs on the interrupt path with the frame already
/// saved; always EOIs and releases the sender's mailbox lock.
pub fn on_ipi(pcpu: &mut PerCpu) {
    let kind = IpiKind::from_u8(pcpu.ipi_kind.swap(IpiKind::None as u8, Ordering::SeqCst));
    let sender = pcpu.ipi_sender.load(Ordering::SeqCst);

    khal::apic::eoi();
    pcpu.ipi_lock.unlock();

    match kind {
        IpiKind::Hello => {
            klog::info!(
                "[smp] CPU {}: hello from CPU {}",
                pcpu.processor_id,
                sender
            );
        }
        IpiKind::Panic => {
            util::panic::note_cpu_halted();
            cpu::halt_forever();
        }
        IpiKind::None => {}
    }
}
