//! Serial port (COM1 UART 16550) driver.
//!
//! The serial port is the kernel's one log sink. It is polled, never
//! interrupt-driven, so it works from the first instruction of boot and
//! keeps working inside interrupt handlers and the panic path.

use core::fmt;
use core::fmt::Write;
use spin::Mutex;

use crate::port::{inb, outb};

/// COM1 base port address.
const COM1_PORT: u16 = 0x3F8;

/// The shared writer. Every `write_*` helper locks this so complete
/// messages from different CPUs do not interleave.
static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

/// Serial port driver state for COM1.
pub struct Serial {
    initialized: bool,
}

impl Serial {
    const fn new() -> Self {
        Self { initialized: false }
    }

    /// Initialize the serial port (115200 baud, 8N1, FIFO on).
    fn init(&mut self) {
        unsafe {
            // Disable UART interrupts; we poll.
            outb(COM1_PORT + 1, 0x00);
            // Enable DLAB to set the baud divisor.
            outb(COM1_PORT + 3, 0x80);
            // Divisor 1 = 115200 baud.
            outb(COM1_PORT, 0x01);
            outb(COM1_PORT + 1, 0x00);
            // 8 bits, no parity, one stop bit; DLAB off.
            outb(COM1_PORT + 3, 0x03);
            // Enable FIFO, clear it, 14-byte threshold.
            outb(COM1_PORT + 2, 0xC7);
            // DTR + RTS + OUT2.
            outb(COM1_PORT + 4, 0x0B);
        }
        self.initialized = true;
    }

    fn is_transmit_empty() -> bool {
        unsafe { inb(COM1_PORT + 5) & 0x20 != 0 }
    }

    fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }
        while !Self::is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe {
            outb(COM1_PORT, byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// One-time serial setup. Called before the first log line.
pub fn init() {
    SERIAL.lock().init();
}

/// Write a raw string to the serial port.
pub fn write_str(s: &str) {
    let mut serial = SERIAL.lock();
    let _ = serial.write_str(s);
}

/// Write formatted text to the serial port.
pub fn write_fmt(args: fmt::Arguments) {
    let mut serial = SERIAL.lock();
    let _ = serial.write_fmt(args);
}

/// Break the serial lock open.
///
/// # Safety
/// Only sound once every other CPU has been halted (panic protocol); the
/// previous owner, if any, must never run again.
pub unsafe fn force_unlock() {
    unsafe {
        SERIAL.force_unlock();
    }
}
