//! Global Descriptor Table (GDT) for x86_64.
//!
//! Long mode mostly ignores segmentation, but a GDT is still required to
//! define the code/data segments for each privilege level and to point
//! the task register at the TSS. Every CPU builds and loads its own copy
//! so each can carry its own TSS descriptor.

use core::arch::asm;
use core::mem::size_of;

use super::tss::Tss;

/// Entry count: eight segment descriptors plus the two-slot TSS
/// descriptor.
const GDT_ENTRIES: usize = 11;

/// The fixed descriptor set, identical on every CPU. The 16- and 32-bit
/// entries exist for firmware hand-off paths that expect the classic
/// layout; the kernel itself only ever loads the 64-bit ring-0 pair.
const SEGMENTS: [u64; 9] = [
    0x0000_0000_0000_0000, // 0x00: null
    0x0000_9A00_0000_FFFF, // 0x08: 16-bit code
    0x0000_9300_0000_FFFF, // 0x10: 16-bit data
    0x00CF_9A00_0000_FFFF, // 0x18: 32-bit ring-0 code
    0x00CF_9300_0000_FFFF, // 0x20: 32-bit ring-0 data
    0x00AF_9B00_0000_FFFF, // 0x28: 64-bit ring-0 code
    0x00AF_9300_0000_FFFF, // 0x30: 64-bit ring-0 data
    0x00AF_FB00_0000_FFFF, // 0x38: 64-bit ring-3 code
    0x00AF_F300_0000_FFFF, // 0x40: 64-bit ring-3 data
];

/// Segment selectors into the fixed layout above. The ring-3 pair is
/// defined but never loaded; there is no user mode here.
#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub kernel_code: u16,
    pub kernel_data: u16,
    #[allow(dead_code)]
    pub user_code: u16,
    #[allow(dead_code)]
    pub user_data: u16,
    pub tss: u16,
}

impl Selectors {
    pub const fn standard() -> Self {
        Self {
            kernel_code: 0x28,
            kernel_data: 0x30,
            user_code: 0x38,
            user_data: 0x40,
            tss: 0x48,
        }
    }
}

/// A per-CPU Global Descriptor Table.
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; GDT_ENTRIES],
}

impl Gdt {
    /// An all-zero GDT; must be initialized with [`Gdt::init`] before
    /// loading.
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; GDT_ENTRIES],
        }
    }

    /// Fill in the descriptor set and the TSS descriptor for this CPU.
    pub fn init(&mut self, tss: &Tss) {
        self.entries[..SEGMENTS.len()].copy_from_slice(&SEGMENTS);

        let tss_addr = tss as *const _ as u64;
        let tss_limit = (size_of::<Tss>() - 1) as u64;

        // 64-bit TSS descriptor, spread over two slots.
        let mut low: u64 = 0;
        low |= tss_limit & 0xFFFF;
        low |= (tss_addr & 0xFFFF) << 16;
        low |= ((tss_addr >> 16) & 0xFF) << 32;
        // Present, DPL 0, type 0x9 = available 64-bit TSS.
        low |= 0x89_u64 << 40;
        low |= ((tss_limit >> 16) & 0xF) << 48;
        low |= ((tss_addr >> 24) & 0xFF) << 56;

        self.entries[9] = low;
        self.entries[10] = tss_addr >> 32;
    }

    /// Load this GDT, reload the segment registers and the task register.
    ///
    /// # Safety
    /// The GDT must stay at this address for the lifetime of the CPU (it
    /// lives inside the eternal per-CPU block), and must have been
    /// initialized.
    pub unsafe fn load(&self, selectors: &Selectors) {
        let ptr = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );

            // Reload CS with a far return.
            asm!(
                "push {sel}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                sel = in(reg) selectors.kernel_code as u64,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            // Reload the data segment registers.
            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) selectors.kernel_data as u16,
                options(nostack, preserves_flags)
            );

            // Load the task register with this CPU's TSS selector.
            asm!(
                "ltr {sel:x}",
                sel = in(reg) selectors.tss,
                options(nostack, preserves_flags)
            );
        }
    }
}

/// Pointer operand for `lgdt`.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}
