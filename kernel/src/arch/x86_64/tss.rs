//! Task State Segment (TSS) for x86_64.
//!
//! In long mode the TSS no longer stores task register state; it holds
//! the stack pointers the CPU switches to on privilege transitions
//! (RSP0-RSP2) and the interrupt stack table. Each CPU gets its own TSS
//! whose RSP slots all point at that CPU's interrupt stack.

/// The 64-bit Task State Segment.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// Stack pointers for privilege level transitions.
    pub rsp: [u64; 3],
    reserved1: u64,
    /// Interrupt Stack Table entries (unused; all interrupts run on the
    /// per-CPU interrupt stack via RSP0-equivalent behavior).
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset of the I/O permission bitmap. `size_of::<Tss>()` means
    /// "no bitmap".
    pub iomap_base: u16,
}

impl Tss {
    /// Create a TSS with empty stack slots.
    pub const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: core::mem::size_of::<Self>() as u16,
        }
    }

    /// Point every privilege-transition stack at `stack_top`.
    pub fn set_all_rsp(&mut self, stack_top: u64) {
        self.rsp = [stack_top; 3];
    }
}
