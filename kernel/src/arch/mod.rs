//! Architecture-specific code. Only x86_64 is supported; the rest of the
//! kernel goes through `crate::arch::x86_64` and nothing else.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
