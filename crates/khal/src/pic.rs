//! Legacy 8259 PIC (Programmable Interrupt Controller) driver.
//!
//! The APIC supersedes the cascaded 8259 pair, but the pair still powers
//! up mapped over the CPU exception vectors and will happily deliver
//! spurious interrupts there. Before the APIC takes over, the PICs are
//! re-initialized to a harmless vector range and every line is masked.

use crate::port::{inb, outb};

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// ICW1: begin initialization, ICW4 follows.
const ICW1_INIT_ICW4: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;

/// Remapped base vectors, clear of the exception range.
const PIC1_OFFSET: u8 = 0x20;
const PIC2_OFFSET: u8 = 0x28;

/// Some chips need a breather between init words.
#[inline]
fn io_wait() {
    unsafe {
        outb(0x80, 0);
    }
}

/// Remap both PICs away from the exception vectors, then mask every
/// line. Idempotent; the bootstrap CPU calls it once before APIC init.
pub fn disable() {
    unsafe {
        // Start the init sequence on both chips.
        outb(PIC1_COMMAND, ICW1_INIT_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT_ICW4);
        io_wait();

        // ICW2: vector offsets.
        outb(PIC1_DATA, PIC1_OFFSET);
        io_wait();
        outb(PIC2_DATA, PIC2_OFFSET);
        io_wait();

        // ICW3: wire the cascade (secondary on IRQ2).
        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();

        // ICW4: 8086 mode.
        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        // Mask all interrupt lines on both chips.
        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
}

/// Read back the interrupt masks, mostly for diagnostics.
pub fn masks() -> (u8, u8) {
    unsafe { (inb(PIC1_DATA), inb(PIC2_DATA)) }
}
