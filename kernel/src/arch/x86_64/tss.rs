//! Task State Segment (TSS) for Helios-OS.
//!
//! The TSS provides:
//! - Interrupt Stack Table (IST) entries for safe exception handling
//! - Ring 3 -> Ring 0 stack switching (privilege_stack_table[0] = rsp0)
//!
//! The I/O permission bitmap base is set past the TSS limit, which disables
//! port filtering entirely.

use core::{
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};
use x86_64::{structures::tss::TaskStateSegment, VirtAddr};

/// IST index used for the double fault handler
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// IST stack size (20 KB)
const IST_STACK_SIZE: usize = 4096 * 5;

/// Static IST stack for the double fault handler
static mut IST_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];

static mut TSS: MaybeUninit<TaskStateSegment> = MaybeUninit::uninit();
static TSS_INIT: AtomicBool = AtomicBool::new(false);

/// Initialize the TSS with IST entries.
///
/// Must be called before `gdt::init()` since the GDT references the TSS.
pub fn init() {
    // SAFETY: Called once during single-threaded init, before interrupts.
    unsafe {
        let stack_ptr = &raw const IST_STACK as *const u8;
        let stack_end = VirtAddr::from_ptr(stack_ptr) + IST_STACK_SIZE as u64;
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_end;
        // I/O map base past the segment limit disables port filtering.
        tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;

        (*(&raw mut TSS)).write(tss);
        TSS_INIT.store(true, Ordering::Release);

        log::info!(
            "TSS initialized: IST[{}] stack @ {:#x} ({} KB)",
            DOUBLE_FAULT_IST_INDEX,
            VirtAddr::from_ptr(stack_ptr).as_u64(),
            IST_STACK_SIZE / 1024,
        );
    }
}

/// Get a reference to the TSS (for GDT descriptor creation).
pub fn tss() -> &'static TaskStateSegment {
    if !TSS_INIT.load(Ordering::Acquire) {
        panic!("TSS not initialized");
    }
    // SAFETY: TSS was initialized in init and lives for 'static.
    unsafe { &*(*(&raw const TSS)).as_ptr() }
}

/// Virtual address of the TSS (for the GDT system descriptor).
pub fn tss_base() -> u64 {
    tss() as *const TaskStateSegment as u64
}

/// Update TSS.rsp0 — the kernel stack pointer used when transitioning from
/// Ring 3 to Ring 0 on interrupts.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    if !TSS_INIT.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: privilege_stack_table[0] is a VirtAddr (u64), writes are
    // atomic on x86_64. Called with interrupts disabled.
    unsafe {
        let tss = (*(&raw mut TSS)).as_mut_ptr();
        (*tss).privilege_stack_table[0] = stack_top;
    }
}
