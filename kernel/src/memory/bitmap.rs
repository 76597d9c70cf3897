//! Bitmap physical frame allocator.
//!
//! One contiguous region is chosen at init: the largest usable memory-map
//! entry whose base is above 1 MiB. A static bitmap tracks one bit per 4 KiB
//! frame (set = used). Frames the firmware reports as non-usable within the
//! chosen region are pre-marked used, as are the first 256 frames of the
//! region as a safety margin.
//!
//! Invalid or already-free frees are silently ignored: the callers that can
//! trigger them (driver teardown after a partial failure) are easier to keep
//! correct when a double free is not fatal.

use crate::boot::entry::{MemoryKind, MemoryRegion};
use crate::memory::frame::{PhysFrame, PAGE_SIZE};
use crate::sync::SpinLock;
use x86_64::PhysAddr;

/// Maximum number of managed frames (4 GiB of RAM at 4 KiB per frame).
const MAX_FRAMES: usize = 1 << 20;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Safety margin: the first frames of the managed region stay reserved.
const RESERVED_HEAD_FRAMES: usize = 256;

const LOW_MEMORY_LIMIT: u64 = 1024 * 1024;

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub free_frames: usize,
    pub used_frames: usize,
    pub total_allocs: u64,
    pub failed_allocs: u64,
}

pub struct FrameBitmap {
    /// One bit per frame; set = used.
    bitmap: [u64; BITMAP_WORDS],
    /// Physical base of the managed region (4 KiB aligned).
    base: u64,
    /// Number of frames managed.
    frame_count: usize,
    free_frames: usize,
    total_allocs: u64,
    failed_allocs: u64,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        FrameBitmap {
            bitmap: [u64::MAX; BITMAP_WORDS],
            base: 0,
            frame_count: 0,
            free_frames: 0,
            total_allocs: 0,
            failed_allocs: 0,
        }
    }

    /// Initialize from the boot memory map.
    ///
    /// Picks the largest `Usable` region above 1 MiB, marks its frames free,
    /// then re-marks firmware holes and the head margin as used.
    pub fn init(&mut self, memory_regions: &[MemoryRegion]) {
        let mut best: Option<(u64, u64)> = None;
        for region in memory_regions {
            if region.kind != MemoryKind::Usable || region.base < LOW_MEMORY_LIMIT {
                continue;
            }
            if best.map_or(true, |(_, size)| region.size > size) {
                best = Some((region.base, region.size));
            }
        }

        let Some((base, size)) = best else {
            log::error!("PMM: no usable memory region above 1 MiB");
            return;
        };

        let base = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let frame_count = ((size / PAGE_SIZE) as usize).min(MAX_FRAMES);

        self.base = base;
        self.frame_count = frame_count;

        for idx in 0..frame_count {
            self.clear_bit(idx);
        }
        self.free_frames = frame_count;

        // Firmware holes inside the managed window stay used.
        let managed_end = base + frame_count as u64 * PAGE_SIZE;
        for region in memory_regions {
            if region.kind == MemoryKind::Usable {
                continue;
            }
            let start = region.base.max(base);
            let end = region.base.saturating_add(region.size).min(managed_end);
            if start >= end {
                continue;
            }
            let first = ((start - base) / PAGE_SIZE) as usize;
            let last = ((end - base + PAGE_SIZE - 1) / PAGE_SIZE) as usize;
            for idx in first..last.min(frame_count) {
                if !self.test_bit(idx) {
                    self.set_bit(idx);
                    self.free_frames -= 1;
                }
            }
        }

        // Head safety margin.
        for idx in 0..RESERVED_HEAD_FRAMES.min(frame_count) {
            if !self.test_bit(idx) {
                self.set_bit(idx);
                self.free_frames -= 1;
            }
        }

        log::info!(
            "PMM: managing {:#x}..{:#x} ({} frames, {} free)",
            base,
            managed_end,
            frame_count,
            self.free_frames
        );
    }

    #[inline]
    fn test_bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    #[inline]
    fn frame_address(&self, idx: usize) -> u64 {
        self.base + idx as u64 * PAGE_SIZE
    }

    /// Allocate a single frame. Linear scan; returns None on exhaustion.
    pub fn alloc_one(&mut self) -> Option<u64> {
        for word in 0..BITMAP_WORDS {
            if self.bitmap[word] == u64::MAX {
                continue;
            }
            let bit = (!self.bitmap[word]).trailing_zeros() as usize;
            let idx = word * 64 + bit;
            if idx >= self.frame_count {
                break;
            }
            self.set_bit(idx);
            self.free_frames -= 1;
            self.total_allocs += 1;
            return Some(self.frame_address(idx));
        }
        self.failed_allocs += 1;
        None
    }

    /// Allocate `n` physically contiguous frames.
    pub fn alloc_n(&mut self, n: usize) -> Option<u64> {
        if n == 0 || n > self.frame_count {
            self.failed_allocs += 1;
            return None;
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for idx in 0..self.frame_count {
            if self.test_bit(idx) {
                run_len = 0;
                run_start = idx + 1;
                continue;
            }
            run_len += 1;
            if run_len == n {
                for i in run_start..run_start + n {
                    self.set_bit(i);
                }
                self.free_frames -= n;
                self.total_allocs += 1;
                return Some(self.frame_address(run_start));
            }
        }
        self.failed_allocs += 1;
        None
    }

    /// Free a single frame. Out-of-range, unaligned, or already-free
    /// addresses are ignored.
    pub fn free_one(&mut self, addr: u64) {
        self.free_n(addr, 1);
    }

    /// Free `n` contiguous frames starting at `addr`.
    pub fn free_n(&mut self, addr: u64, n: usize) {
        if addr % PAGE_SIZE != 0 || addr < self.base {
            return;
        }
        let first = ((addr - self.base) / PAGE_SIZE) as usize;
        if first + n > self.frame_count {
            return;
        }
        for idx in first..first + n {
            if self.test_bit(idx) {
                self.clear_bit(idx);
                self.free_frames += 1;
            }
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            free_frames: self.free_frames,
            used_frames: self.frame_count - self.free_frames,
            total_allocs: self.total_allocs,
            failed_allocs: self.failed_allocs,
        }
    }

    /// Bytes still free in the managed region.
    pub fn free_memory(&self) -> u64 {
        self.free_frames as u64 * PAGE_SIZE
    }
}

static FRAME_ALLOCATOR: SpinLock<FrameBitmap> = SpinLock::new(FrameBitmap::new());

/// Initialize the global frame allocator from the boot memory map.
pub fn init_frame_allocator(memory_regions: &[MemoryRegion]) {
    FRAME_ALLOCATOR.lock().init(memory_regions);
}

/// Allocate one 4 KiB frame.
pub fn allocate_frame() -> Option<PhysFrame> {
    let addr = FRAME_ALLOCATOR.lock().alloc_one()?;
    Some(PhysFrame {
        start_address: PhysAddr::new(addr),
    })
}

/// Allocate `n` physically contiguous frames.
pub fn allocate_frames(n: usize) -> Option<PhysFrame> {
    let addr = FRAME_ALLOCATOR.lock().alloc_n(n)?;
    Some(PhysFrame {
        start_address: PhysAddr::new(addr),
    })
}

/// Allocate `n` contiguous, zeroed frames for DMA (queue memory, staging
/// buffers). The zeroing goes through the HHDM view.
pub fn allocate_dma_frames(n: usize) -> Option<PhysFrame> {
    let frame = allocate_frames(n)?;
    let virt = crate::memory::phys_to_virt(frame.as_u64());
    // SAFETY: the frames were just allocated and the HHDM maps all RAM.
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, n * PAGE_SIZE as usize);
    }
    Some(frame)
}

/// Return one frame to the allocator.
pub fn free_frame(frame: PhysFrame) {
    FRAME_ALLOCATOR.lock().free_one(frame.as_u64());
}

/// Return `n` contiguous frames to the allocator.
pub fn free_frames(frame: PhysFrame, n: usize) {
    FRAME_ALLOCATOR.lock().free_n(frame.as_u64(), n);
}

/// Snapshot the allocator statistics.
pub fn frame_stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::entry::{MemoryKind, MemoryRegion};

    fn test_map() -> [MemoryRegion; 3] {
        [
            MemoryRegion {
                base: 0,
                size: 0x9F000,
                kind: MemoryKind::Usable,
            },
            MemoryRegion {
                base: 0x10_0000,
                size: 16 * 1024 * 1024,
                kind: MemoryKind::Usable,
            },
            MemoryRegion {
                base: 0x10_0000 + 8 * 1024 * 1024,
                size: 64 * 1024,
                kind: MemoryKind::Reserved,
            },
        ]
    }

    fn fresh() -> alloc::boxed::Box<FrameBitmap> {
        let mut bm = alloc::boxed::Box::new(FrameBitmap::new());
        bm.init(&test_map());
        bm
    }

    #[test]
    fn test_picks_region_above_1mib() {
        let bm = fresh();
        assert_eq!(bm.base, 0x10_0000);
        assert_eq!(bm.frame_count, 4096);
    }

    #[test]
    fn test_alloc_is_page_aligned() {
        let mut bm = fresh();
        for n in [1usize, 8, 512] {
            let addr = bm.alloc_n(n).unwrap();
            assert_eq!(addr & 0xFFF, 0);
            bm.free_n(addr, n);
        }
    }

    #[test]
    fn test_alloc_free_round_trip_restores_bitmap() {
        let mut bm = fresh();
        let before = bm.bitmap;
        let free_before = bm.free_frames;
        let addr = bm.alloc_n(8).unwrap();
        assert_ne!(bm.bitmap, before);
        bm.free_n(addr, 8);
        assert_eq!(bm.bitmap, before);
        assert_eq!(bm.free_frames, free_before);
    }

    #[test]
    fn test_head_margin_reserved() {
        let mut bm = fresh();
        let addr = bm.alloc_one().unwrap();
        assert!(addr >= bm.base + RESERVED_HEAD_FRAMES as u64 * PAGE_SIZE);
    }

    #[test]
    fn test_firmware_hole_not_handed_out() {
        let mut bm = fresh();
        let hole_start = 0x10_0000 + 8 * 1024 * 1024;
        let hole_end = hole_start + 64 * 1024;
        while let Some(addr) = bm.alloc_one() {
            assert!(addr < hole_start || addr >= hole_end);
        }
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut bm = fresh();
        let expected = bm.free_frames;
        let mut count = 0usize;
        while bm.alloc_one().is_some() {
            count += 1;
        }
        assert_eq!(count, expected);
        assert!(bm.alloc_one().is_none());
        assert_eq!(bm.free_memory(), 0);
        assert!(bm.stats().failed_allocs >= 2);
    }

    #[test]
    fn test_double_free_ignored() {
        let mut bm = fresh();
        let addr = bm.alloc_one().unwrap();
        let free_before = bm.free_frames;
        bm.free_one(addr);
        bm.free_one(addr);
        assert_eq!(bm.free_frames, free_before + 1);
    }

    #[test]
    fn test_invalid_free_ignored() {
        let mut bm = fresh();
        let free_before = bm.free_frames;
        bm.free_one(0x123); // unaligned
        bm.free_one(0x1000); // below managed base
        assert_eq!(bm.free_frames, free_before);
    }
}
