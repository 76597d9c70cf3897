use core::panic::PanicInfo;

/// Panic handler for the kernel: report on serial, then halt forever.
pub fn panic_handler(info: &PanicInfo) -> ! {
    // Disable interrupts to prevent further issues
    crate::arch::x86_64::cli();

    crate::serial_println!("=== KERNEL PANIC ===");
    if let Some(location) = info.location() {
        crate::serial_println!(
            "Panic at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::serial_println!("Message: {}", info.message());
    crate::serial_println!("====================");

    // Halt the CPU
    loop {
        crate::arch::x86_64::hlt();
    }
}
