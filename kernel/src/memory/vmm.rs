// =============================================================================
// AsterOS - Virtual Memory Manager
// =============================================================================
//
// Four-level x86_64 paging. A virtual address splits into four 9-bit
// table indices plus a 12-bit offset; each level is a 512-entry table in
// a PMM-owned frame, reached through the HHDM.
//
// Two entry bits carry kernel semantics in the available range:
//
//   PART_OF_PMM - the address field references a PMM-owned frame that
//                 must be released when the entry is unmapped.
//   NEED_ALLOC  - the leaf is absent but will be demand-paged on fault:
//                 a frame is allocated and filled with the repeated low
//                 nibble of the entry's protection key.
//
// Address spaces share the upper (kernel) half: `clone` copies the upper
// 256 PML4 entries verbatim and deep-copies the lower half only when
// asked to.
// =============================================================================

use bitflags::bitflags;

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::interrupts::Registers;
use crate::arch::x86_64::smp::PerCpu;
use crate::memory::address::{hhdm_offset, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::pmm;

/// PML4 slots covering the kernel heap range. Pre-allocated on the first
/// clone so every later address space shares them without
/// synchronization.
pub const KHEAP_PML4_START: usize = 0x1F4;
pub const KHEAP_PML4_END: usize = 0x1F5;

/// First PML4 slot of the shared kernel half.
const KERNEL_PML4_START: usize = 0x100;

bitflags! {
    /// x86_64 page table entry flags, plus the kernel's two semantic
    /// bits in the OS-available range (9 and 10).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is valid; absent entries fault on access.
        const PRESENT       = 1 << 0;
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Ring-3 access allowed.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled, for MMIO mappings.
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write (leaf entries).
        const DIRTY         = 1 << 6;
        /// Page attribute table bit (leaf entries).
        const PAT           = 1 << 7;
        /// TLB entry survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// The referenced frame belongs to the PMM and is freed on unmap.
        const PART_OF_PMM   = 1 << 9;
        /// Demand-page on fault: allocate a frame and fill it with the
        /// repeated protection-key nibble.
        const NEED_ALLOC    = 1 << 10;
        /// Instruction fetches fault.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical address bits 12..51 of an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Protection key nibble, bits 59..62.
const PROT_KEY_SHIFT: u64 = 59;
const PROT_KEY_MASK: u64 = 0xF << PROT_KEY_SHIFT;

/// A single 64-bit page table entry.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    pub const EMPTY: Self = Self(0);

    /// Build an entry from a frame address and flags.
    pub fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(addr.is_page_aligned());
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    #[allow(dead_code)]
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn set_addr(&mut self, addr: PhysAddr) {
        debug_assert!(addr.is_page_aligned());
        self.0 = (self.0 & !ADDR_MASK) | (addr.as_u64() & ADDR_MASK);
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn has(self, flags: PageFlags) -> bool {
        self.0 & flags.bits() == flags.bits()
    }

    #[inline]
    pub fn insert(&mut self, flags: PageFlags) {
        self.0 |= flags.bits();
    }

    #[inline]
    pub fn remove(&mut self, flags: PageFlags) {
        self.0 &= !flags.bits();
    }

    /// The 4-bit protection key.
    #[inline]
    pub fn prot_key(self) -> u8 {
        ((self.0 & PROT_KEY_MASK) >> PROT_KEY_SHIFT) as u8
    }

    #[allow(dead_code)]
    #[inline]
    pub fn set_prot_key(&mut self, key: u8) {
        self.0 = (self.0 & !PROT_KEY_MASK) | (((key & 0xF) as u64) << PROT_KEY_SHIFT);
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() || !self.is_empty() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// A 512-entry page table at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; 512],
}

impl PageTable {
    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &PageEntry {
        &self.entries[index]
    }

    /// `true` when no entry is in use.
    pub fn is_unused(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }
}

/// A page map: the virtual (HHDM) address of a PML4 root.
#[derive(Clone, Copy)]
pub struct AddressSpace {
    root: VirtAddr,
}

impl AddressSpace {
    /// The address space the calling CPU is running on.
    pub fn from_cr3() -> Self {
        Self {
            root: PhysAddr::new(cpu::read_cr3() & ADDR_MASK).to_virt(),
        }
    }

    /// Physical address of the root table.
    pub fn root_phys(&self) -> PhysAddr {
        PhysAddr::new(self.root.as_u64() - hhdm_offset())
    }

    fn root_table(&self) -> &'static mut PageTable {
        // SAFETY: root points at a live PML4 frame under the HHDM.
        unsafe { &mut *self.root.as_mut_ptr::<PageTable>() }
    }

    fn table_at(addr: PhysAddr) -> &'static mut PageTable {
        // SAFETY: page table frames are PMM-owned RAM under the HHDM.
        unsafe { &mut *addr.to_virt().as_mut_ptr::<PageTable>() }
    }

    /// Follow `entry` to the next level, creating the table on demand.
    /// Fresh tables come from the PMM, zeroed, flagged
    /// `PRESENT | WRITABLE | PART_OF_PMM`.
    fn next_table_or_create(entry: &mut PageEntry) -> Option<&'static mut PageTable> {
        if entry.is_present() {
            return Some(Self::table_at(entry.addr()));
        }

        let frame = pmm::allocate()?;
        // SAFETY: fresh PMM frame under the HHDM.
        unsafe {
            core::ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        *entry = PageEntry::new(
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::PART_OF_PMM,
        );
        Some(Self::table_at(frame))
    }

    fn next_table(entry: &PageEntry) -> Option<&'static mut PageTable> {
        if entry.is_present() {
            Some(Self::table_at(entry.addr()))
        } else {
            None
        }
    }

    /// Install `entry` as the leaf for `va`, allocating intermediate
    /// tables on demand. Whatever was mapped there before is unmapped
    /// first (freeing its PMM-backed frame if it had one).
    ///
    /// Returns `false` when the PMM runs dry while building the walk.
    pub fn map(&mut self, va: VirtAddr, entry: PageEntry) -> bool {
        let [i0, i1, i2, i3] = va.page_table_indices();

        let pml4 = self.root_table();
        let Some(pdpt) = Self::next_table_or_create(pml4.entry_mut(i3)) else {
            return false;
        };
        let Some(pd) = Self::next_table_or_create(pdpt.entry_mut(i2)) else {
            return false;
        };
        let Some(pt) = Self::next_table_or_create(pd.entry_mut(i1)) else {
            return false;
        };

        if !pt.entry(i0).is_empty() {
            self.unmap(va, false);
        }

        *pt.entry_mut(i0) = entry;
        true
    }

    /// Install a lazily-faulted leaf at `va`: `NEED_ALLOC | PART_OF_PMM`
    /// plus the given permission bits, address field zero. The real frame
    /// arrives on first touch.
    pub fn map_page(&mut self, va: VirtAddr, rw: bool, user: bool, xd: bool) -> bool {
        let mut flags = PageFlags::NEED_ALLOC | PageFlags::PART_OF_PMM;
        if rw {
            flags |= PageFlags::WRITABLE;
        }
        if user {
            flags |= PageFlags::USER;
        }
        if xd {
            flags |= PageFlags::NO_EXECUTE;
        }
        self.map(va, PageEntry::new(PhysAddr::zero(), flags))
    }

    /// Clear the leaf for `va`; a present PMM-backed frame is returned to
    /// the PMM. With `remove_empty_uppers`, intermediate tables left with
    /// no live entries are freed as well.
    pub fn unmap(&mut self, va: VirtAddr, remove_empty_uppers: bool) {
        let [i0, i1, i2, i3] = va.page_table_indices();

        // Raw entry pointers: the sweep below walks the same tables the
        // leaf walk does, which reference-level borrows cannot express.
        // SAFETY: every pointer is derived from a live page table frame
        // and the caller has exclusive use of this address space.
        unsafe {
            let pml4_entry: *mut PageEntry = self.root_table().entry_mut(i3);
            if !(*pml4_entry).is_present() {
                return;
            }
            let pdpt = Self::table_at((*pml4_entry).addr());
            let pdpt_entry: *mut PageEntry = pdpt.entry_mut(i2);
            if !(*pdpt_entry).is_present() {
                return;
            }
            let pd = Self::table_at((*pdpt_entry).addr());
            let pd_entry: *mut PageEntry = pd.entry_mut(i1);
            if !(*pd_entry).is_present() {
                return;
            }
            let pt = Self::table_at((*pd_entry).addr());

            let leaf = pt.entry_mut(i0);
            if leaf.is_present() && leaf.has(PageFlags::PART_OF_PMM) {
                pmm::free(leaf.addr());
            }
            leaf.clear();

            if remove_empty_uppers {
                // Retire each table that just became empty, bottom up,
                // as long as the parent entry owns its frame.
                let levels: [(*const PageTable, *mut PageEntry); 3] = [
                    (pt, pd_entry),
                    (pd, pdpt_entry),
                    (pdpt, pml4_entry),
                ];
                for (table, parent_entry) in levels {
                    if !(*table).is_unused() {
                        break;
                    }
                    if (*parent_entry).has(PageFlags::PART_OF_PMM) {
                        pmm::free((*parent_entry).addr());
                    }
                    (*parent_entry).clear();
                }
            }
        }
    }

    /// Walk to the leaf entry for `va` without modifying anything.
    ///
    /// Returns the entry whenever every intermediate table exists, even
    /// if the leaf itself is absent - the fault resolver needs to see
    /// `NEED_ALLOC` leaves.
    pub fn resolve(&self, va: VirtAddr) -> Option<&'static mut PageEntry> {
        let [i0, i1, i2, i3] = va.page_table_indices();

        let pml4 = self.root_table();
        let pdpt = Self::next_table(pml4.entry(i3))?;
        let pd = Self::next_table(pdpt.entry(i2))?;
        let pt = Self::next_table(pd.entry(i1))?;
        Some(pt.entry_mut(i0))
    }

    /// Make this address space current on the calling CPU.
    ///
    /// Rejects a root outside the HHDM - such a pointer cannot be a page
    /// map this kernel built.
    pub fn switch_to(&self) {
        if self.root.as_u64() < hhdm_offset() {
            klog::error!("page map root {} is not inside the HHDM", self.root);
            return;
        }
        // SAFETY: root_phys points at a PML4 that maps the kernel (all
        // address spaces share the upper half).
        unsafe {
            cpu::write_cr3(self.root_phys().as_u64());
        }
    }

    /// Clone this address space.
    ///
    /// The upper half's PML4 entries are copied verbatim so every address
    /// space shares the kernel mappings. The lower half is deep-copied
    /// only when `keep_lower_half` is set: every PMM-owned leaf is copied
    /// into a freshly allocated frame (copy-on-write is a future
    /// optimization). The first clone on each CPU also pre-allocates the
    /// kernel-heap PML4 slots so they never need syncing afterwards.
    ///
    /// # Panics
    /// On physical memory exhaustion; address-space cloning has no
    /// recovery path.
    pub fn clone_map(&self, keep_lower_half: bool) -> AddressSpace {
        let root_frame = allocate_table_frame();
        let new_root = Self::table_at(root_frame);
        let old_root = self.root_table();

        if keep_lower_half {
            for i in 0..KERNEL_PML4_START {
                let entry = old_root.entry(i);
                if !entry.is_present() {
                    continue;
                }
                let child = clone_subtree(Self::table_at(entry.addr()), 3);
                let mut new_entry = *entry;
                new_entry.set_addr(child);
                *new_root.entry_mut(i) = new_entry;
            }
        }

        // The kernel half is shared, not copied.
        for i in KERNEL_PML4_START..512 {
            *new_root.entry_mut(i) = *old_root.entry(i);
        }

        let cpu = PerCpu::current();
        if !cpu.kheap_pml4_initted {
            cpu.kheap_pml4_initted = true;

            for i in KHEAP_PML4_START..KHEAP_PML4_END {
                if new_root.entry(i).is_present() {
                    continue;
                }
                let frame = allocate_table_frame();
                *new_root.entry_mut(i) = PageEntry::new(
                    frame,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::PART_OF_PMM,
                );
            }
        }

        AddressSpace {
            root: root_frame.to_virt(),
        }
    }
}

/// Allocate and zero one page-table frame; panics when the PMM is empty.
fn allocate_table_frame() -> PhysAddr {
    let frame = pmm::allocate().expect("out of physical memory while building page tables");
    // SAFETY: fresh PMM frame under the HHDM.
    unsafe {
        core::ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    frame
}

/// Deep-copy one table subtree. `level` 1 is a page table whose entries
/// are leaves; higher levels recurse.
fn clone_subtree(src: &PageTable, level: u8) -> PhysAddr {
    let frame = allocate_table_frame();
    let dst = AddressSpace::table_at(frame);

    for i in 0..512 {
        let entry = src.entry(i);
        if entry.is_empty() {
            continue;
        }

        let mut new_entry = *entry;

        if level == 1 {
            if entry.is_present() && entry.has(PageFlags::PART_OF_PMM) {
                let copy = pmm::allocate().expect("out of physical memory while cloning pages");
                // SAFETY: both frames are RAM under the HHDM.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        entry.addr().to_virt().as_ptr::<u8>(),
                        copy.to_virt().as_mut_ptr::<u8>(),
                        PAGE_SIZE as usize,
                    );
                }
                new_entry.set_addr(copy);
            }
        } else if entry.is_present() {
            let child = clone_subtree(AddressSpace::table_at(entry.addr()), level - 1);
            new_entry.set_addr(child);
        }

        *dst.entry_mut(i) = new_entry;
    }

    frame
}

// --- Page fault resolution ---

/// Error code bit 0: the fault was on a present page.
const FAULT_PRESENT: u64 = 1 << 0;
/// Error code bit 1: the access was a write.
const FAULT_WRITE: u64 = 1 << 1;

/// Resolve a page fault or die trying.
///
/// Demand pages (`NEED_ALLOC` leaves) are materialized here: a PMM frame
/// is allocated, filled with the repeated protection-key nibble, and the
/// leaf flips to `PRESENT | PART_OF_PMM`. Anything else is fatal.
pub fn handle_page_fault(regs: &mut Registers) {
    let cr2 = regs.cr2;
    let space = AddressSpace::from_cr3();

    let entry = match space.resolve(VirtAddr::new(cr2)) {
        Some(entry) => entry,
        None => invalid_fault(regs),
    };

    if regs.error_code & FAULT_PRESENT == 0 {
        // Already present: another CPU resolved the same fault between
        // the access and this handler. Nothing to do.
        if entry.is_present() {
            return;
        }

        if entry.has(PageFlags::NEED_ALLOC) {
            let frame = match pmm::allocate() {
                Some(frame) => frame,
                None => panic!(
                    "out of physical memory on demand page: CR2 {:#018X} RIP {:#018X}",
                    cr2, regs.rip
                ),
            };

            let nibble = entry.prot_key();
            let fill = nibble << 4 | nibble;
            // SAFETY: fresh PMM frame under the HHDM.
            unsafe {
                core::ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), fill, PAGE_SIZE as usize);
            }

            entry.set_addr(frame);
            entry.remove(PageFlags::NEED_ALLOC);
            entry.insert(PageFlags::PART_OF_PMM | PageFlags::PRESENT);

            cpu::invlpg(cr2);
            return;
        }

        invalid_fault(regs);
    }

    if regs.error_code & FAULT_WRITE != 0 {
        // Copy-on-write is a future extension; a write fault on a
        // present page has no legitimate cause today.
        invalid_fault(regs);
    }

    invalid_fault(regs);
}

fn invalid_fault(regs: &Registers) -> ! {
    panic!(
        "invalid page fault: CR2 {:#018X} RIP {:#018X} error code {:#06X}",
        regs.cr2, regs.rip, regs.error_code
    );
}
