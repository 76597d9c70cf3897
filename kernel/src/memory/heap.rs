// Heap allocator backed by the frame allocator

use crate::memory::bitmap;
use crate::memory::frame::{PhysFrame, PAGE_SIZE};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use x86_64::PhysAddr;

/// GlobalAlloc that carves whole frames out of the bitmap allocator and
/// returns their HHDM-mapped virtual addresses. Fine-grained allocation is
/// not needed in the core: allocations are driver descriptors and registry
/// vectors, all page-scale or rare.
pub struct FrameBackedHeap;

unsafe impl GlobalAlloc for FrameBackedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align());
        let pages = size.div_ceil(PAGE_SIZE as usize);

        match bitmap::allocate_frames(pages) {
            Some(frame) => crate::memory::phys_to_virt(frame.as_u64()) as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = layout.size().max(layout.align());
        let pages = size.div_ceil(PAGE_SIZE as usize);

        let phys = crate::memory::virt_to_phys(ptr as u64);
        if let Ok(frame) = PhysFrame::from_start_address(PhysAddr::new(phys)) {
            bitmap::free_frames(frame, pages);
        }
    }
}

#[cfg(not(test))]
#[global_allocator]
static HEAP_ALLOCATOR: FrameBackedHeap = FrameBackedHeap;
