//! Virtual memory manager: 4-level page tables for x86_64.
//!
//! All page-table memory is reached through the HHDM, so any table can be
//! edited regardless of which address space is active. The walker supports
//! 4 KiB, 2 MiB and 1 GiB mappings; an entry with HUGE set at PDPT or PD
//! level terminates the walk.
//!
//! The kernel half (PML4[256..512]) is shared across address spaces; see
//! `address_space.rs` for creation/cloning rules.

use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::tlb;
use x86_64::VirtAddr;

use crate::memory::arena::VirtArena;
use crate::memory::{allocate_frame, free_frame, frame::PhysFrame, phys_to_virt, PAGE_SIZE};
use crate::sync::SpinLock;
use x86_64::PhysAddr;

bitflags! {
    /// Requested mapping attributes. Translated to raw entry bits by
    /// `entry_bits`; NX is silently dropped when the CPU lacks support.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const NOCACHE      = 1 << 4;
        const ACCESSED     = 1 << 5;
        const DIRTY        = 1 << 6;
        const HUGE         = 1 << 7;
        const GLOBAL       = 1 << 8;
        const NX           = 1 << 63;
    }
}

/// Physical-address mask of a page-table entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const ENTRIES_PER_TABLE: usize = 512;
const HUGE_2M: u64 = 2 * 1024 * 1024;
const HUGE_1G: u64 = 1024 * 1024 * 1024;

/// HHDM window treated as always-mapped by `is_mapped` (matches the frame
/// allocator's 4 GiB management cap).
const HHDM_SPAN: u64 = 4 * 1024 * 1024 * 1024;

static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfMemory,
    AlreadyMapped,
    NotMapped,
}

/// Initialize the paging subsystem: cache NX support and register the
/// virtual arenas.
pub fn init() {
    let nx = crate::arch::x86_64::cpu_supports_nx();
    NX_SUPPORTED.store(nx, Ordering::Relaxed);
    log::info!(
        "VMM: paging initialized (NX {})",
        if nx { "supported" } else { "unavailable" }
    );
}

#[inline]
const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

#[inline]
const fn pdpt_index(va: u64) -> usize {
    ((va >> 30) & 0x1FF) as usize
}

#[inline]
const fn pd_index(va: u64) -> usize {
    ((va >> 21) & 0x1FF) as usize
}

#[inline]
const fn pt_index(va: u64) -> usize {
    ((va >> 12) & 0x1FF) as usize
}

/// Translate requested flags into raw entry bits.
fn entry_bits(flags: PageFlags, nx_supported: bool) -> u64 {
    let mut bits = flags.bits();
    if !nx_supported {
        bits &= !PageFlags::NX.bits();
    }
    bits
}

fn nx_supported() -> bool {
    NX_SUPPORTED.load(Ordering::Relaxed)
}

/// Access a page table through the HHDM.
///
/// # Safety
/// `table_phys` must be the physical address of a page-table page.
unsafe fn table_mut(table_phys: u64) -> &'static mut [u64; ENTRIES_PER_TABLE] {
    unsafe { &mut *(phys_to_virt(table_phys) as *mut [u64; ENTRIES_PER_TABLE]) }
}

/// Walk one level down, allocating the child table if absent.
///
/// Intermediate entries for user-accessible mappings carry USER at every
/// level; WRITABLE is always set on intermediates (leaf entries restrict).
unsafe fn ensure_table(entry: &mut u64, user: bool) -> Result<u64, MapError> {
    if *entry & PageFlags::PRESENT.bits() != 0 {
        if user && *entry & PageFlags::USER.bits() == 0 {
            *entry |= PageFlags::USER.bits();
        }
        return Ok(*entry & ADDR_MASK);
    }

    let frame = allocate_frame().ok_or(MapError::OutOfMemory)?;
    let phys = frame.as_u64();
    // SAFETY: freshly allocated frame, HHDM-mapped.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys) as *mut u8, 0, PAGE_SIZE as usize);
    }

    let mut bits = phys | PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits();
    if user {
        bits |= PageFlags::USER.bits();
    }
    *entry = bits;
    Ok(phys)
}

/// Map a 4 KiB page in the given address space.
pub fn map_page_in(pml4_phys: u64, va: u64, pa: u64, flags: PageFlags) -> Result<(), MapError> {
    let user = flags.contains(PageFlags::USER);
    let bits = entry_bits(flags | PageFlags::PRESENT, nx_supported()) & !PageFlags::HUGE.bits();

    // SAFETY: pml4_phys names a valid page-table tree reached via HHDM.
    unsafe {
        let pml4 = table_mut(pml4_phys);
        let pdpt_phys = ensure_table(&mut pml4[pml4_index(va)], user)?;
        let pdpt = table_mut(pdpt_phys);
        let pdpt_entry = &mut pdpt[pdpt_index(va)];
        if *pdpt_entry & PageFlags::HUGE.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        let pd_phys = ensure_table(pdpt_entry, user)?;
        let pd = table_mut(pd_phys);
        let pd_entry = &mut pd[pd_index(va)];
        if *pd_entry & PageFlags::HUGE.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        let pt_phys = ensure_table(pd_entry, user)?;
        let pt = table_mut(pt_phys);
        let pt_entry = &mut pt[pt_index(va)];
        if *pt_entry & PageFlags::PRESENT.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        *pt_entry = (pa & ADDR_MASK) | bits;
    }

    invalidate(va);
    Ok(())
}

/// Map a 2 MiB page in the given address space.
fn map_huge_2m_in(pml4_phys: u64, va: u64, pa: u64, flags: PageFlags) -> Result<(), MapError> {
    let user = flags.contains(PageFlags::USER);
    let bits = entry_bits(flags | PageFlags::PRESENT | PageFlags::HUGE, nx_supported());

    // SAFETY: as in map_page_in.
    unsafe {
        let pml4 = table_mut(pml4_phys);
        let pdpt_phys = ensure_table(&mut pml4[pml4_index(va)], user)?;
        let pdpt = table_mut(pdpt_phys);
        let pdpt_entry = &mut pdpt[pdpt_index(va)];
        if *pdpt_entry & PageFlags::HUGE.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        let pd_phys = ensure_table(pdpt_entry, user)?;
        let pd = table_mut(pd_phys);
        let pd_entry = &mut pd[pd_index(va)];
        if *pd_entry & PageFlags::PRESENT.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        *pd_entry = (pa & ADDR_MASK) | bits;
    }

    invalidate(va);
    Ok(())
}

/// Map a 4 KiB page in the current address space.
pub fn map_page(va: u64, pa: u64, flags: PageFlags) -> Result<(), MapError> {
    map_page_in(super::address_space::current_pml4(), va, pa, flags)
}

/// Map `n` pages starting at `va` -> `pa`.
///
/// Uses 2 MiB pages when `va` and `pa` are 2 MiB-aligned, `flags` allows
/// HUGE, and at least 512 pages remain; 4 KiB otherwise. On any failure the
/// partially-installed mappings are rolled back.
pub fn map_pages(va: u64, pa: u64, n: usize, flags: PageFlags) -> Result<(), MapError> {
    let pml4 = super::address_space::current_pml4();
    let mut mapped_pages = 0usize;

    let result = (|| {
        while mapped_pages < n {
            let cur_va = va + mapped_pages as u64 * PAGE_SIZE;
            let cur_pa = pa + mapped_pages as u64 * PAGE_SIZE;
            let remaining = n - mapped_pages;

            if flags.contains(PageFlags::HUGE)
                && cur_va % HUGE_2M == 0
                && cur_pa % HUGE_2M == 0
                && remaining >= 512
            {
                map_huge_2m_in(pml4, cur_va, cur_pa, flags)?;
                mapped_pages += 512;
            } else {
                map_page_in(pml4, cur_va, cur_pa, flags & !PageFlags::HUGE)?;
                mapped_pages += 1;
            }
        }
        Ok(())
    })();

    if result.is_err() {
        let mut undone = 0usize;
        while undone < mapped_pages {
            let cur_va = va + undone as u64 * PAGE_SIZE;
            match unmap_page_in(pml4, cur_va) {
                Some(Unmapped::Huge2M(_)) => undone += 512,
                _ => undone += 1,
            }
        }
    }

    result
}

/// What `unmap_page` found at the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmapped {
    Page4K(u64),
    Huge2M(u64),
    Huge1G(u64),
}

impl Unmapped {
    pub fn phys(self) -> u64 {
        match self {
            Unmapped::Page4K(pa) | Unmapped::Huge2M(pa) | Unmapped::Huge1G(pa) => pa,
        }
    }
}

/// Unmap the page containing `va` in the given address space.
///
/// Tolerates huge entries at PDPT/PD level: the huge entry itself is zeroed.
pub fn unmap_page_in(pml4_phys: u64, va: u64) -> Option<Unmapped> {
    // SAFETY: walking a valid table tree via HHDM.
    let result = unsafe {
        let pml4 = table_mut(pml4_phys);
        let pml4_entry = pml4[pml4_index(va)];
        if pml4_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pdpt = table_mut(pml4_entry & ADDR_MASK);
        let pdpt_entry = &mut pdpt[pdpt_index(va)];
        if *pdpt_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if *pdpt_entry & PageFlags::HUGE.bits() != 0 {
            let pa = *pdpt_entry & ADDR_MASK;
            *pdpt_entry = 0;
            Some(Unmapped::Huge1G(pa))
        } else {
            let pd = table_mut(*pdpt_entry & ADDR_MASK);
            let pd_entry = &mut pd[pd_index(va)];
            if *pd_entry & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            if *pd_entry & PageFlags::HUGE.bits() != 0 {
                let pa = *pd_entry & ADDR_MASK;
                *pd_entry = 0;
                Some(Unmapped::Huge2M(pa))
            } else {
                let pt = table_mut(*pd_entry & ADDR_MASK);
                let pt_entry = &mut pt[pt_index(va)];
                if *pt_entry & PageFlags::PRESENT.bits() == 0 {
                    return None;
                }
                let pa = *pt_entry & ADDR_MASK;
                *pt_entry = 0;
                Some(Unmapped::Page4K(pa))
            }
        }
    };

    if result.is_some() {
        invalidate(va);
    }
    result
}

/// Unmap the page containing `va` in the current address space.
pub fn unmap_page(va: u64) -> Option<Unmapped> {
    unmap_page_in(super::address_space::current_pml4(), va)
}

/// Translate `va` to its physical address, respecting huge pages.
pub fn get_physical(va: u64) -> Option<u64> {
    get_physical_in(super::address_space::current_pml4(), va)
}

pub fn get_physical_in(pml4_phys: u64, va: u64) -> Option<u64> {
    // SAFETY: read-only walk of a valid table tree via HHDM.
    unsafe {
        let pml4 = table_mut(pml4_phys);
        let pml4_entry = pml4[pml4_index(va)];
        if pml4_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pdpt = table_mut(pml4_entry & ADDR_MASK);
        let pdpt_entry = pdpt[pdpt_index(va)];
        if pdpt_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pdpt_entry & PageFlags::HUGE.bits() != 0 {
            return Some((pdpt_entry & ADDR_MASK & !(HUGE_1G - 1)) + (va % HUGE_1G));
        }
        let pd = table_mut(pdpt_entry & ADDR_MASK);
        let pd_entry = pd[pd_index(va)];
        if pd_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pd_entry & PageFlags::HUGE.bits() != 0 {
            return Some((pd_entry & ADDR_MASK & !(HUGE_2M - 1)) + (va % HUGE_2M));
        }
        let pt = table_mut(pd_entry & ADDR_MASK);
        let pt_entry = pt[pt_index(va)];
        if pt_entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pt_entry & ADDR_MASK) + (va % PAGE_SIZE))
    }
}

/// Check whether `va` is mapped. Addresses inside the HHDM window
/// short-circuit to true.
pub fn is_mapped(va: u64) -> bool {
    let hhdm = crate::memory::hhdm_offset();
    if hhdm != 0 && va >= hhdm && va < hhdm + HHDM_SPAN {
        return true;
    }
    get_physical(va).is_some()
}

#[inline]
fn invalidate(va: u64) {
    tlb::flush(VirtAddr::new_truncate(va));
}

// ─── Virtual arenas & high-level allocation ──────────────────────────────────

const KERNEL_ARENA_BASE: u64 = 0xFFFF_C000_0000_0000;
const KERNEL_ARENA_SIZE: u64 = 1 << 30;
const USER_ARENA_BASE: u64 = 0x0000_4000_0000_0000;
const USER_ARENA_SIZE: u64 = 1 << 30;

static KERNEL_ARENA: SpinLock<VirtArena> = SpinLock::new(VirtArena::new(
    "kernel",
    KERNEL_ARENA_BASE,
    KERNEL_ARENA_SIZE,
));
static USER_ARENA: SpinLock<VirtArena> =
    SpinLock::new(VirtArena::new("user", USER_ARENA_BASE, USER_ARENA_SIZE));

fn arena_for(flags: PageFlags) -> &'static SpinLock<VirtArena> {
    if flags.contains(PageFlags::USER) {
        &USER_ARENA
    } else {
        &KERNEL_ARENA
    }
}

/// Allocate `size` bytes of virtual memory backed by fresh frames.
///
/// Rounds up to whole pages; every newly-mapped page is zero-filled through
/// the HHDM view. Returns None on exhaustion (virtual or physical).
pub fn allocate(size: u64, flags: PageFlags) -> Option<u64> {
    let pages = (size.div_ceil(PAGE_SIZE)) as usize;
    let arena = arena_for(flags);
    let va = arena.lock().allocate(pages)?;

    for i in 0..pages {
        let page_va = va + i as u64 * PAGE_SIZE;
        let Some(frame) = allocate_frame() else {
            rollback_allocate(arena, va, i);
            return None;
        };
        if map_page(page_va, frame.as_u64(), flags | PageFlags::PRESENT).is_err() {
            free_frame(frame);
            rollback_allocate(arena, va, i);
            return None;
        }
        // SAFETY: frame just mapped and HHDM-visible.
        unsafe {
            core::ptr::write_bytes(
                phys_to_virt(frame.as_u64()) as *mut u8,
                0,
                PAGE_SIZE as usize,
            );
        }
    }

    Some(va)
}

fn rollback_allocate(arena: &'static SpinLock<VirtArena>, va: u64, mapped: usize) {
    for i in 0..mapped {
        let page_va = va + i as u64 * PAGE_SIZE;
        if let Some(unmapped) = unmap_page(page_va) {
            free_frame(PhysFrame {
                start_address: PhysAddr::new(unmapped.phys()),
            });
        }
    }
    arena.lock().release(va);
}

/// Free a region returned by `allocate`.
pub fn free(va: u64, size: u64) {
    let pages = (size.div_ceil(PAGE_SIZE)) as usize;
    let arena = if KERNEL_ARENA.lock().contains(va) {
        &KERNEL_ARENA
    } else {
        &USER_ARENA
    };

    for i in 0..pages {
        let page_va = va + i as u64 * PAGE_SIZE;
        if let Some(unmapped) = unmap_page(page_va) {
            free_frame(PhysFrame {
                start_address: PhysAddr::new(unmapped.phys()),
            });
        }
    }
    arena.lock().release(va);
}

/// Map a physical range (MMIO) into the kernel arena.
///
/// The offset of `pa` within its page is preserved in the returned virtual
/// address. Drivers pass NOCACHE for device register windows.
pub fn map_physical(pa: u64, size: u64, flags: PageFlags) -> Option<u64> {
    let page_offset = pa % PAGE_SIZE;
    let pa_base = pa - page_offset;
    let pages = ((size + page_offset).div_ceil(PAGE_SIZE)) as usize;

    let va = KERNEL_ARENA.lock().allocate(pages)?;
    for i in 0..pages {
        let page_va = va + i as u64 * PAGE_SIZE;
        let page_pa = pa_base + i as u64 * PAGE_SIZE;
        if map_page(page_va, page_pa, flags | PageFlags::PRESENT).is_err() {
            for j in 0..i {
                unmap_page(va + j as u64 * PAGE_SIZE);
            }
            KERNEL_ARENA.lock().release(va);
            return None;
        }
    }
    Some(va + page_offset)
}

/// Unmap a range returned by `map_physical`. The backing frames belong to
/// the device and are not freed.
pub fn unmap_physical(va: u64, size: u64) {
    let page_offset = va % PAGE_SIZE;
    let va_base = va - page_offset;
    let pages = ((size + page_offset).div_ceil(PAGE_SIZE)) as usize;

    for i in 0..pages {
        unmap_page(va_base + i as u64 * PAGE_SIZE);
    }
    KERNEL_ARENA.lock().release(va_base);
}

// ─── Page fault intake ───────────────────────────────────────────────────────

/// Page-fault intake from the IDT. The core performs no demand paging, so
/// every fault is refused; the trap handler prints the diagnostic and halts.
pub fn handle_page_fault(_fault_addr: u64, _error_code: u64) -> bool {
    false
}

/// Print the fixed unhandled-page-fault diagnostic.
pub fn print_page_fault_diagnostic(fault_addr: u64, error_code: u64, rip: u64) {
    log::error!("PAGE FAULT at {:#x}", fault_addr);
    log::error!(
        "  error: {} {} {} {} {}",
        if error_code & 1 != 0 {
            "protection"
        } else {
            "not-present"
        },
        if error_code & 2 != 0 { "write" } else { "read" },
        if error_code & 4 != 0 { "user" } else { "kernel" },
        if error_code & 8 != 0 {
            "reserved-bit"
        } else {
            ""
        },
        if error_code & 16 != 0 { "ifetch" } else { "" },
    );
    log::error!("  RIP: {:#x}", rip);
    if let Some(pa) = get_physical(fault_addr) {
        log::error!("  mapped: yes, phys={:#x}", pa);
    } else {
        log::error!("  mapped: no");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_bits_drop_nx_when_unsupported() {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NX;
        assert_eq!(entry_bits(flags, true) & (1 << 63), 1 << 63);
        assert_eq!(entry_bits(flags, false) & (1 << 63), 0);
    }

    #[test]
    fn test_table_indices() {
        let va = 0xFFFF_8000_1234_5678u64;
        assert_eq!(pml4_index(va), (va as usize >> 39) & 0x1FF);
        assert_eq!(pt_index(va), (va as usize >> 12) & 0x1FF);
        // Consecutive pages differ only in PT index until the 2 MiB boundary.
        assert_eq!(pd_index(0x20_0000), pd_index(0x20_0000 + 0x1F_F000));
        assert_ne!(pd_index(0x20_0000), pd_index(0x40_0000));
    }

    #[test]
    fn test_unmapped_phys_accessor() {
        assert_eq!(Unmapped::Page4K(0x1000).phys(), 0x1000);
        assert_eq!(Unmapped::Huge2M(0x20_0000).phys(), 0x20_0000);
    }
}
