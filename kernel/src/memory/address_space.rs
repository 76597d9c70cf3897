//! Address spaces for Helios-OS.
//!
//! An address space is identified by the physical address of its PML4.
//! The kernel half (PML4[256..512]) is shared: creating a new space clones
//! those entries from the kernel table, so kernel mapping changes propagate
//! through the shared lower-level tables.
//!
//! x86_64 virtual address space layout:
//! - PML4[0..256]   → User space (per-process, zeroed for new spaces)
//! - PML4[256..512] → Kernel space (shared, cloned from kernel PML4)

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    PhysAddr,
};

use crate::memory::{allocate_frame, free_frame, frame::PhysFrame, phys_to_virt, PAGE_SIZE};

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PRESENT: u64 = 1;
const HUGE: u64 = 1 << 7;

/// Physical address of the kernel PML4 (captured at init, never changes).
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);
/// Physical address of the currently active PML4 (tracked CR3).
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);

/// Capture the boot CR3 as the kernel address space.
///
/// Must be called once during single-threaded init, after the HHDM offset is
/// known.
pub fn init_kernel_address_space() {
    let (frame, _flags) = Cr3::read();
    let phys = frame.start_address().as_u64();
    KERNEL_PML4.store(phys, Ordering::Relaxed);
    CURRENT_PML4.store(phys, Ordering::Relaxed);
    log::info!("Kernel address space initialized: CR3={:#x}", phys);
}

/// Physical address of the kernel PML4.
pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::Relaxed)
}

/// Physical address of the active PML4.
pub fn current_pml4() -> u64 {
    CURRENT_PML4.load(Ordering::Relaxed)
}

/// Create a new address space with the kernel half cloned.
///
/// Returns the physical address of the new PML4, or None on allocation
/// failure.
pub fn create_address_space() -> Option<u64> {
    let frame = allocate_frame()?;
    let new_pml4_phys = frame.as_u64();
    let new_virt = phys_to_virt(new_pml4_phys);

    // SAFETY: freshly allocated frame, HHDM-mapped; kernel PML4 is valid.
    unsafe {
        core::ptr::write_bytes(new_virt as *mut u8, 0, PAGE_SIZE as usize);

        let kernel = phys_to_virt(kernel_pml4()) as *const u64;
        let new = new_virt as *mut u64;
        for i in 256..ENTRIES {
            *new.add(i) = *kernel.add(i);
        }
    }

    log::debug!("Address space created: PML4={:#x}", new_pml4_phys);
    Some(new_pml4_phys)
}

/// Switch to the given address space (writes CR3).
pub fn switch_address_space(pml4_phys: u64) {
    let frame = x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(pml4_phys));
    // SAFETY: pml4_phys came from create_address_space or the boot CR3;
    // the kernel half is present in every space so execution continues.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
    CURRENT_PML4.store(pml4_phys, Ordering::Relaxed);
}

/// Destroy an address space: free the page-table pages of the lower half,
/// then the PML4 itself.
///
/// Leaf frames (the user's data pages) are NOT freed here; their ownership
/// policy belongs to the caller. The kernel space and the active space are
/// refused.
pub fn delete_address_space(pml4_phys: u64) {
    if pml4_phys == kernel_pml4() {
        log::warn!("VMM: refusing to delete the kernel address space");
        return;
    }
    if pml4_phys == current_pml4() {
        log::warn!("VMM: refusing to delete the active address space");
        return;
    }

    // SAFETY: the space is inactive and no longer referenced by any task;
    // all tables are HHDM-visible.
    unsafe {
        let pml4 = phys_to_virt(pml4_phys) as *const u64;
        for i in 0..256 {
            let pml4_entry = *pml4.add(i);
            if pml4_entry & PRESENT == 0 {
                continue;
            }
            let pdpt_phys = pml4_entry & ADDR_MASK;
            let pdpt = phys_to_virt(pdpt_phys) as *const u64;
            for j in 0..ENTRIES {
                let pdpt_entry = *pdpt.add(j);
                if pdpt_entry & PRESENT == 0 || pdpt_entry & HUGE != 0 {
                    continue;
                }
                let pd_phys = pdpt_entry & ADDR_MASK;
                let pd = phys_to_virt(pd_phys) as *const u64;
                for k in 0..ENTRIES {
                    let pd_entry = *pd.add(k);
                    if pd_entry & PRESENT == 0 || pd_entry & HUGE != 0 {
                        continue;
                    }
                    free_table(pd_entry & ADDR_MASK);
                }
                free_table(pd_phys);
            }
            free_table(pdpt_phys);
        }
    }
    free_table(pml4_phys);
    log::debug!("Address space deleted: PML4={:#x}", pml4_phys);
}

fn free_table(phys: u64) {
    free_frame(PhysFrame {
        start_address: PhysAddr::new(phys),
    });
}
