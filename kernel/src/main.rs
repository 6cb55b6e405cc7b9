//! AsterOS kernel entry point.
//!
//! Limine drops every CPU into long mode with the higher-half direct map
//! already in place. The bootstrap processor lands in `_start`, brings up
//! the console and the physical memory manager, then hands over to
//! [`arch::x86_64::smp::start_all`], which never returns: it walks every
//! processor (itself included) through per-CPU initialization and into
//! its scheduler.
#![no_std]
#![no_main]

extern crate alloc;

mod acpi;
mod arch;
mod memory;
mod sched;
mod time;
mod util;

use arch::x86_64::{boot, cpu, smp};

/// Kernel entry point, called by the Limine bootloader on the BSP.
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    if !boot::base_revision_supported() {
        // Too old a loader to trust any response; nothing to log with yet.
        cpu::halt_forever();
    }

    klog::init();

    let (name, version) = boot::bootloader_info();
    klog::info!(
        "AsterOS {} - booted by {} {}",
        env!("CARGO_PKG_VERSION"),
        name,
        version
    );

    // The HHDM offset must be known before anything touches physical
    // memory through virtual pointers (the PMM free lists live there).
    unsafe {
        memory::address::init_hhdm(boot::hhdm_offset());
    }
    klog::debug!("HHDM offset: {:#018X}", boot::hhdm_offset());

    if let Some(fb) = boot::framebuffer_info() {
        klog::info!(
            "Framebuffer: {}x{} pitch {} bpp {} at {:#X}",
            fb.width,
            fb.height,
            fb.pitch,
            fb.bpp,
            fb.address as u64
        );
    }

    memory::pmm::init(boot::memory_map());

    if !khal::apic::is_present() {
        panic!("no local APIC present; cannot run a multi-processor kernel");
    }

    let cpus = boot::mp_response().cpus().len();
    klog::info!(
        "{} system processor{} [{} KiB memory] multi-processor kernel",
        cpus,
        if cpus == 1 { "" } else { "s" },
        memory::pmm::total_pages() * 4
    );

    smp::start_all()
}
