// Memory management module

pub mod address_space;
pub mod arena;
pub mod bitmap;
pub mod frame;
pub mod heap;
pub mod paging;

use crate::boot::entry::MemoryRegion;
use core::sync::atomic::{AtomicU64, Ordering};

/// Higher Half Direct Map offset.
/// Set once from the bootloader handoff, before any physical memory access.
/// All physical-to-virtual conversions must add this offset.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Store the HHDM offset (call once, early in boot)
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

/// Get the current HHDM offset
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Convert a physical address to a virtual address using the HHDM offset
#[inline]
pub fn phys_to_virt(phys: u64) -> u64 {
    phys.wrapping_add(HHDM_OFFSET.load(Ordering::Relaxed))
}

/// Convert a virtual address back to a physical address (reverse of phys_to_virt)
#[inline]
pub fn virt_to_phys(virt: u64) -> u64 {
    virt.wrapping_sub(HHDM_OFFSET.load(Ordering::Relaxed))
}

/// Initialize the physical memory manager from the boot memory map.
pub fn init_memory_manager(memory_regions: &[MemoryRegion]) {
    bitmap::init_frame_allocator(memory_regions);
}

// Re-exports
pub use bitmap::{
    allocate_dma_frames, allocate_frame, allocate_frames, frame_stats, free_frame, free_frames,
    FrameStats,
};
pub use frame::{AllocError, PhysFrame, PAGE_SIZE};
