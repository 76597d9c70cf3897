//! Boot subsystem
//!
//! Regroups all code involved in early kernel startup:
//! - bootloader handoff structures (BootInfo)
//! - Limine boot-protocol entry point
//! - early serial logger
//! - kernel panic handler

/// BootInfo structures shared between bootloader and kernel
pub mod entry;

/// Limine boot-protocol entry point
pub mod limine;

/// Early serial logger (used throughout the kernel lifetime)
pub mod logger;

/// Kernel panic handler
pub mod panic;
