//! Helios-OS Kernel Core
//!
//! The low-level subsystems that turn raw hardware into an execution
//! substrate:
//! - CPU descriptor tables (GDT/TSS, IDT) and PIC/IRQ dispatch
//! - Physical frame allocator and virtual memory manager
//! - PIT timer, sleeps, and the driver timeout wheel
//! - NVMe and AHCI/SATA block storage drivers
//!
//! The filesystem browser, ELF loader, scheduler and network stack sit on
//! top of the block-device interface exported by `hardware::storage`.

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod hardware;
pub mod memory;
pub mod sync;

use boot::entry::{BootInfo, MemoryRegion};

// serial_print! and serial_println! macros are #[macro_export]'ed from
// arch::x86_64::serial and available at crate root automatically.

/// Timer tick rate for the whole core.
pub const TIMER_HZ: u32 = arch::x86_64::pit::TIMER_HZ;

/// Interval of the periodic GDT integrity check.
const GDT_CHECK_INTERVAL_MS: u64 = 1000;

/// Kernel panic handler
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    boot::panic::panic_handler(info)
}

/// Main kernel initialization - called by the bootloader entry point.
///
/// # Safety
/// `args` must point to a valid `BootInfo` from the bootloader handoff.
pub unsafe fn kernel_main(args: *const BootInfo) -> ! {
    // =============================================
    // Phase 1: serial output + logger
    // =============================================
    arch::x86_64::serial::init();
    boot::logger::init();

    serial_println!("");
    serial_println!("=====================================================");
    serial_println!("  Helios-OS kernel v0.1.0");
    serial_println!("=====================================================");

    if args.is_null() {
        serial_println!("[CRIT] No BootInfo provided. System will hang.");
        loop {
            arch::x86_64::hlt();
        }
    }
    let args = &*args;

    // =============================================
    // Phase 2: HHDM offset + physical memory manager
    // =============================================
    memory::set_hhdm_offset(args.hhdm_offset);
    serial_println!("[init] HHDM offset: {:#x}", args.hhdm_offset);
    serial_println!(
        "[init] Kernel at phys {:#x} / virt {:#x}",
        args.kernel_phys_base,
        args.kernel_virt_base
    );

    let mmap = core::slice::from_raw_parts(
        args.memory_map_base as *const MemoryRegion,
        args.memory_map_len as usize,
    );
    memory::init_memory_manager(mmap);
    serial_println!("[init] Frame allocator ready.");

    // =============================================
    // Phase 3: CPU descriptor tables
    // =============================================
    serial_println!("[init] TSS...");
    arch::x86_64::tss::init();
    serial_println!("[init] GDT...");
    arch::x86_64::gdt::init();
    serial_println!("[init] IDT...");
    arch::x86_64::idt::init();

    // =============================================
    // Phase 4: virtual memory manager
    // =============================================
    serial_println!("[init] Paging...");
    memory::paging::init();
    memory::address_space::init_kernel_address_space();
    serial_println!("[init] VMM ready.");

    // =============================================
    // Phase 5: interrupt controller + timer
    // =============================================
    serial_println!("[init] PIC...");
    arch::x86_64::pic::init(arch::x86_64::pic::PIC1_OFFSET, arch::x86_64::pic::PIC2_OFFSET);
    serial_println!("[init] PIT...");
    arch::x86_64::pit::init(TIMER_HZ);
    arch::x86_64::sti();
    serial_println!("[init] Interrupts enabled ({} Hz tick).", TIMER_HZ);

    // GDT self-defence rides on the timer from here on.
    arch::x86_64::pit::register_callback(
        arch::x86_64::gdt::integrity_check_callback,
        core::ptr::null_mut(),
        GDT_CHECK_INTERVAL_MS,
    );

    // =============================================
    // Phase 6: storage drivers
    // =============================================
    serial_println!("[init] Storage drivers...");
    hardware::init();

    report_devices();

    let stats = memory::frame_stats();
    serial_println!(
        "[init] Boot complete. {} frames free, {} used.",
        stats.free_frames,
        stats.used_frames
    );

    // The core has no scheduler; sit in the idle loop and service
    // interrupts (timer callbacks keep running the GDT checks).
    loop {
        arch::x86_64::hlt();
    }
}

fn report_devices() {
    let devices = hardware::storage::device_count();
    if devices == 0 {
        serial_println!("[init] No block devices found.");
        return;
    }
    for id in 0..devices {
        if let Some(line) = hardware::storage::info(id) {
            serial_println!("[init] Block device {}: {}", id, line);
        }
        if let Some((sectors, sector_size)) = hardware::storage::get_device(id)
            .and_then(|d| hardware::storage::BlockDevice::geometry(d.as_ref()))
        {
            serial_println!(
                "[init]   {} sectors of {} B ({} MiB)",
                sectors,
                sector_size,
                sectors * sector_size as u64 / (1024 * 1024)
            );
        }
    }
}
