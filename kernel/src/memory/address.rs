// =============================================================================
// AsterOS - Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual one is among the most
// catastrophic kernel bugs, so they are separate newtypes. Converting
// between them goes through the HHDM: Limine maps all physical memory at
// a fixed virtual offset, so `virt = phys + hhdm_offset` for any physical
// byte.
// =============================================================================

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// Bit shift for standard pages.
#[allow(dead_code)]
pub const PAGE_SHIFT: u64 = 12;

/// The virtual offset where Limine maps all physical memory. Zero until
/// `init_hhdm` runs; reads before that are a bug.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// One-time installation of the HHDM offset from the boot response.
///
/// # Safety
/// Must be called exactly once, on the BSP, before any `PhysAddr::to_virt`
/// call and before any other CPU is started.
pub unsafe fn init_hhdm(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The configured HHDM offset.
#[inline]
pub fn hhdm_offset() -> u64 {
    let offset = HHDM_OFFSET.load(Ordering::Relaxed);
    debug_assert!(offset != 0, "HHDM offset read before init_hhdm");
    offset
}

/// A physical memory address.
///
/// What the CPU puts on the bus after translation. At most 52 bits on
/// x86_64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wraps a raw physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "physical address exceeds the 52-bit limit"
        );
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The HHDM virtual mapping of this physical address.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset())
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[allow(dead_code)]
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

/// A virtual memory address.
///
/// 48 bits used, sign-extended to 64 ("canonical"); the user half has
/// bit 47 clear, the kernel half has it set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wraps a canonical virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        // Sign-extend bit 47 and compare: canonical addresses survive
        // the round trip unchanged.
        let canonical = ((addr << 16) as i64 >> 16) as u64;
        debug_assert!(addr == canonical, "non-canonical virtual address");
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// `true` for upper-half (kernel) addresses.
    #[allow(dead_code)]
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xFFFF_8000_0000_0000
    }

    #[allow(dead_code)]
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[allow(dead_code)]
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// The four 9-bit page table indices of this address, leaf level
    /// first: `[PT, PD, PDPT, PML4]`.
    #[inline]
    pub const fn page_table_indices(self) -> [usize; 4] {
        [
            (self.0 >> 12) as usize & 0x1FF,
            (self.0 >> 21) as usize & 0x1FF,
            (self.0 >> 30) as usize & 0x1FF,
            (self.0 >> 39) as usize & 0x1FF,
        ]
    }

    /// The 12-bit offset within the page.
    #[allow(dead_code)]
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}
