// =============================================================================
// AsterOS - ACPI Table Walker
// =============================================================================
//
// A deliberately small consumer of ACPI: validate the RSDP, walk the
// RSDT, log every table signature found, and hand HPET tables to the
// timer layer. Nothing else in the firmware forest is interesting to
// this kernel core.
//
// All table pointers arrive as physical addresses and are read through
// the HHDM.
// =============================================================================

use crate::arch::x86_64::boot;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::vmm::{AddressSpace, PageEntry, PageFlags};
use crate::time;

/// Where the HPET register page gets mapped.
pub const HPET_MMIO_VIRT: u64 = 0xFFFF_FFFE_0000_0000;

/// Root System Description Pointer, revision 1 layout (the RSDT part is
/// all we use; an XSDT-bearing system still carries a valid RSDT).
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
}

/// Common header of every system description table.
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// ACPI generic address structure.
#[repr(C, packed)]
struct GenericAddress {
    space_id: u8,
    bit_width: u8,
    bit_offset: u8,
    reserved: u8,
    address: u64,
}

/// The HPET description table.
#[repr(C, packed)]
struct HpetTable {
    header: SdtHeader,
    hardware_rev_id: u8,
    /// Comparator count, counter size, legacy replacement bits.
    capabilities: u8,
    pci_vendor_id: u16,
    address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

/// Sum of all table bytes modulo 256 must be zero.
fn checksum_ok(ptr: *const u8, length: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..length {
        // SAFETY: the caller hands a table fully inside the HHDM.
        sum = sum.wrapping_add(unsafe { *ptr.add(i) });
    }
    sum == 0
}

/// Walk the RSDT and feed discovered tables to their consumers.
///
/// BSP only. Quietly does nothing when the loader provided no RSDP.
pub fn init() {
    let Some(rsdp_addr) = boot::rsdp_address() else {
        klog::warn!("[acpi] no RSDP from bootloader; staying on the PIT");
        return;
    };

    // SAFETY: Limine hands the RSDP mapped and readable.
    let rsdp = unsafe { &*(rsdp_addr as *const Rsdp) };
    if &rsdp.signature != b"RSD PTR " {
        klog::warn!("[acpi] bad RSDP signature; staying on the PIT");
        return;
    }

    let rsdt_virt = PhysAddr::new(rsdp.rsdt_addr as u64).to_virt();
    // SAFETY: the RSDT lives in ACPI-reclaimable memory under the HHDM.
    let rsdt = unsafe { &*rsdt_virt.as_ptr::<SdtHeader>() };
    if &rsdt.signature != b"RSDT" {
        klog::warn!("[acpi] bad RSDT signature; staying on the PIT");
        return;
    }

    let entry_count =
        (rsdt.length as usize - core::mem::size_of::<SdtHeader>()) / core::mem::size_of::<u32>();
    let entries = (rsdt_virt.as_u64() + core::mem::size_of::<SdtHeader>() as u64) as *const u32;

    for i in 0..entry_count {
        // SAFETY: entry_count bounds the array per the RSDT length.
        let table_phys = unsafe { core::ptr::read_unaligned(entries.add(i)) } as u64;
        let table_virt = PhysAddr::new(table_phys).to_virt();
        // SAFETY: system description tables are HHDM-reachable.
        let header = unsafe { &*table_virt.as_ptr::<SdtHeader>() };

        let sig = header.signature;
        klog::info!(
            "[acpi] table: {}{}{}{}",
            sig[0] as char,
            sig[1] as char,
            sig[2] as char,
            sig[3] as char
        );

        if !checksum_ok(table_virt.as_ptr::<u8>(), header.length as usize) {
            klog::warn!("[acpi] checksum mismatch; skipping table");
            continue;
        }

        if &sig == b"HPET" {
            // SAFETY: signature and checksum verified above.
            hpet_found(unsafe { &*table_virt.as_ptr::<HpetTable>() });
        }
    }
}

/// Map the HPET register page, sanity-check the counter, and promote it
/// to reference clock.
fn hpet_found(table: &HpetTable) {
    let mmio_phys = table.address.address;

    let mut space = AddressSpace::from_cr3();
    let mapped = space.map(
        VirtAddr::new(HPET_MMIO_VIRT),
        PageEntry::new(
            PhysAddr::new(mmio_phys),
            PageFlags::PRESENT
                | PageFlags::WRITABLE
                | PageFlags::NO_CACHE
                | PageFlags::NO_EXECUTE,
        ),
    );
    if !mapped {
        klog::warn!("[acpi] could not map HPET MMIO; staying on the PIT");
        return;
    }

    // SAFETY: the page just mapped covers the register block,
    // cache-disabled, for the kernel's lifetime.
    unsafe {
        khal::hpet::install(HPET_MMIO_VIRT);
    }

    let period = khal::hpet::counter_clock_period();
    klog::info!(
        "[hpet] capabilities {:#018X}, period {} fs/tick ({} ns)",
        khal::hpet::general_caps(),
        period,
        period / khal::hpet::FEMTOS_PER_NANO
    );

    if period > khal::hpet::MAX_PERIOD_FS {
        klog::warn!("[hpet] period above the 100 ns the HPET specification allows");
    }
    if !khal::hpet::is_64bit() {
        klog::warn!("[hpet] 32-bit main counter; overflow handling is poor");
    }

    khal::hpet::enable();

    // The counter must advance strictly across twenty 1 ms PIT sleeps,
    // or it cannot be trusted as the reference.
    let mut last = khal::hpet::raw_ticks();
    for _ in 0..20 {
        khal::pit::polled_sleep(1_000_000);
        let value = khal::hpet::raw_ticks();
        if value <= last {
            klog::error!(
                "[hpet] counter not monotonic ({} after {}); staying on the PIT",
                value,
                last
            );
            return;
        }
        last = value;
    }

    time::select_hpet();
}
