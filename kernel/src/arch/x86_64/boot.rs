// =============================================================================
// AsterOS - Limine Boot Protocol Interface
// =============================================================================
//
// The kernel binary carries static "request" structures; Limine finds them
// by scanning the `.limine_requests` section and writes a pointer to a
// response into each one before jumping to `_start`. This module declares
// every request the kernel makes and wraps the responses in typed
// accessors.
//
// The `#[used]` attribute keeps the statics alive even though no Rust code
// takes their address; the link section puts them where the bootloader
// scans.
// =============================================================================

use limine::request::{
    BootloaderInfoRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, MpRequest,
    RsdpRequest,
};
use limine::response::MpResponse;
use limine::BaseRevision;

/// Base revision tag - tells Limine which protocol revision we speak.
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Bootloader name and version, for the boot banner.
#[used]
#[link_section = ".limine_requests"]
static BOOTLOADER_INFO_REQUEST: BootloaderInfoRequest = BootloaderInfoRequest::new();

/// The Higher Half Direct Map offset: `virt = phys + offset` maps every
/// physical byte readable and writable.
#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// The physical memory map. Usable entries are page-aligned and
/// non-overlapping; they become the PMM's regions.
#[used]
#[link_section = ".limine_requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// SMP descriptors: one entry per logical processor, each with a
/// `goto_address` slot the kernel writes to wake the CPU and an `extra`
/// slot it uses to hand the CPU its own state block.
#[used]
#[link_section = ".limine_requests"]
static MP_REQUEST: MpRequest = MpRequest::new();

/// Framebuffer descriptor. The core only reports it; rendering belongs
/// to an external collaborator.
#[used]
#[link_section = ".limine_requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Pointer to the ACPI root system description, consumed by the RSDT
/// walker for HPET discovery.
#[used]
#[link_section = ".limine_requests"]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

/// Shape of the framebuffer response, detached from Limine's structures.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub address: *mut u8,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
}

/// `true` when the booting Limine speaks our base revision.
pub fn base_revision_supported() -> bool {
    BASE_REVISION.is_supported()
}

/// Bootloader name and version strings.
pub fn bootloader_info() -> (&'static str, &'static str) {
    match BOOTLOADER_INFO_REQUEST.get_response() {
        Some(resp) => (resp.name(), resp.version()),
        None => ("unknown", "unknown"),
    }
}

/// The HHDM offset.
///
/// # Panics
/// If the response is missing - the kernel cannot run without it.
pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("Limine HHDM response not available - boot protocol error")
        .offset()
}

/// The physical memory map entries, sorted by base address.
///
/// # Panics
/// If the response is missing.
pub fn memory_map() -> &'static [&'static limine::memory_map::Entry] {
    MEMORY_MAP_REQUEST
        .get_response()
        .expect("Limine memory map response not available - boot protocol error")
        .entries()
}

/// The SMP response.
///
/// # Panics
/// If the response is missing.
pub fn mp_response() -> &'static MpResponse {
    MP_REQUEST
        .get_response()
        .expect("Limine MP response not available - boot protocol error")
}

/// Framebuffer geometry, if the loader set one up.
pub fn framebuffer_info() -> Option<FramebufferInfo> {
    let response = FRAMEBUFFER_REQUEST.get_response()?;
    let fb = response.framebuffers().next()?;

    Some(FramebufferInfo {
        address: fb.addr() as *mut u8,
        width: fb.width(),
        height: fb.height(),
        pitch: fb.pitch(),
        bpp: fb.bpp(),
    })
}

/// Address of the ACPI RSDP structure, if ACPI is available.
pub fn rsdp_address() -> Option<u64> {
    let response = RSDP_REQUEST.get_response()?;
    Some(response.address() as u64)
}
