//! Global Descriptor Table (GDT) for Helios-OS.
//!
//! Installs a 7-entry GDT: null, kernel code, kernel data, user code, user
//! data, and a two-slot 64-bit TSS descriptor. Long-mode segmentation is
//! essentially flat; only the selectors matter (interrupt entry and iret).
//!
//! The table is kept as raw descriptors rather than an opaque builder so the
//! integrity machinery below can checksum and restore the exact image.
//!
//! ## Self-defence
//!
//! The image is checksummed at init and a backup copy is kept. A periodic
//! timer callback revalidates the live table (null descriptor, access bytes,
//! checksum). Three consecutive mismatches trigger recovery from the backup;
//! recovery attempts are bounded and exceeding the bound is fatal.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use x86_64::{
    instructions::{
        segmentation::{Segment, CS, DS, ES, FS, GS, SS},
        tables::{lgdt, load_tss},
    },
    structures::{gdt::SegmentSelector, DescriptorTablePointer},
    PrivilegeLevel, VirtAddr,
};

const GDT_ENTRIES: usize = 7;

/// Selectors fixed by the table layout.
pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring0);

/// Access bytes fixed by the ABI.
const KERNEL_CODE_ACCESS: u8 = 0x9A;
const KERNEL_DATA_ACCESS: u8 = 0x92;
const USER_CODE_ACCESS: u8 = 0xFA;
const USER_DATA_ACCESS: u8 = 0xF2;
const TSS_ACCESS: u8 = 0x89;

/// Granularity/flags bytes: L=1 for 64-bit code, D/B=1 for data.
const CODE_FLAGS: u8 = 0xA0;
const DATA_FLAGS: u8 = 0xC0;

/// Consecutive validation failures before recovery kicks in.
const FAILURES_BEFORE_RECOVERY: u32 = 3;
/// Recoveries allowed before the corruption is considered fatal.
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

static mut GDT_IMAGE: [u64; GDT_ENTRIES] = [0; GDT_ENTRIES];
static mut GDT_BACKUP: [u64; GDT_ENTRIES] = [0; GDT_ENTRIES];
static GDT_CHECKSUM: AtomicU64 = AtomicU64::new(0);
static CONSECUTIVE_FAILURES: AtomicU32 = AtomicU32::new(0);
static RECOVERY_ATTEMPTS: AtomicU32 = AtomicU32::new(0);

/// Build a flat code/data descriptor with the given access and flags bytes.
const fn make_segment(access: u8, flags: u8) -> u64 {
    // limit[15:0] = 0xFFFF, base = 0, limit[19:16] = 0xF in the flags byte.
    0xFFFF | ((access as u64) << 40) | (((flags | 0x0F) as u64) << 48)
}

/// Build the two-slot 64-bit TSS system descriptor.
const fn make_tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
    let low = (limit as u64 & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | ((TSS_ACCESS as u64) << 40)
        | (((limit as u64 >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56);
    let high = base >> 32;
    (low, high)
}

/// Build the full 7-entry image for a TSS at `tss_base`.
fn build_image(tss_base: u64, tss_limit: u32) -> [u64; GDT_ENTRIES] {
    let (tss_low, tss_high) = make_tss_descriptor(tss_base, tss_limit);
    [
        0,
        make_segment(KERNEL_CODE_ACCESS, CODE_FLAGS),
        make_segment(KERNEL_DATA_ACCESS, DATA_FLAGS),
        make_segment(USER_CODE_ACCESS, CODE_FLAGS),
        make_segment(USER_DATA_ACCESS, DATA_FLAGS),
        tss_low,
        tss_high,
    ]
}

/// FNV-1a over the raw descriptor bytes.
fn image_checksum(image: &[u64; GDT_ENTRIES]) -> u64 {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
    for entry in image {
        for byte in entry.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
    }
    hash
}

/// What a validation pass found wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GdtFault {
    NullDescriptor,
    KernelCodeAccess,
    KernelDataAccess,
    TssAccess,
    Checksum,
}

/// Validate an image against the expected access bytes and checksum.
fn validate_image(image: &[u64; GDT_ENTRIES], expected_checksum: u64) -> Result<(), GdtFault> {
    if image[0] != 0 {
        return Err(GdtFault::NullDescriptor);
    }
    if (image[1] >> 40) as u8 != KERNEL_CODE_ACCESS {
        return Err(GdtFault::KernelCodeAccess);
    }
    if (image[2] >> 40) as u8 != KERNEL_DATA_ACCESS {
        return Err(GdtFault::KernelDataAccess);
    }
    if (image[5] >> 40) as u8 != TSS_ACCESS {
        return Err(GdtFault::TssAccess);
    }
    if image_checksum(image) != expected_checksum {
        return Err(GdtFault::Checksum);
    }
    Ok(())
}

/// Load the live image into the CPU: lgdt, reload CS via far return, then
/// the data segments, then ltr.
unsafe fn load() {
    let image = &raw const GDT_IMAGE;
    let pointer = DescriptorTablePointer {
        limit: (GDT_ENTRIES * 8 - 1) as u16,
        base: VirtAddr::from_ptr(image as *const u64),
    };

    unsafe {
        lgdt(&pointer);
        CS::set_reg(KERNEL_CODE_SELECTOR);
        DS::set_reg(KERNEL_DATA_SELECTOR);
        ES::set_reg(KERNEL_DATA_SELECTOR);
        FS::set_reg(KERNEL_DATA_SELECTOR);
        GS::set_reg(KERNEL_DATA_SELECTOR);
        SS::set_reg(KERNEL_DATA_SELECTOR);
        load_tss(TSS_SELECTOR);
    }
}

/// Initialize and load the GDT.
///
/// **Prerequisite**: `tss::init()` must be called first.
pub fn init() {
    let tss_base = super::tss::tss_base();
    let tss_limit = (core::mem::size_of::<x86_64::structures::tss::TaskStateSegment>() - 1) as u32;
    let image = build_image(tss_base, tss_limit);

    let interrupts_were_enabled = crate::arch::x86_64::interrupts_enabled();
    crate::arch::x86_64::cli();

    // SAFETY: Single-threaded init with interrupts disabled; the statics
    // live for 'static so lgdt may reference them.
    unsafe {
        *(&raw mut GDT_IMAGE) = image;
        *(&raw mut GDT_BACKUP) = image;
        GDT_CHECKSUM.store(image_checksum(&image), Ordering::Release);
        load();
    }

    if interrupts_were_enabled {
        crate::arch::x86_64::sti();
    }

    log::info!(
        "GDT loaded: CS={:#x} DS/SS={:#x} user CS={:#x} user DS={:#x} TSS={:#x}",
        KERNEL_CODE_SELECTOR.0,
        KERNEL_DATA_SELECTOR.0,
        USER_CODE_SELECTOR.0,
        USER_DATA_SELECTOR.0,
        TSS_SELECTOR.0,
    );
}

/// Revalidate the live table. Returns true when the image is intact.
///
/// After `FAILURES_BEFORE_RECOVERY` consecutive mismatches the table is
/// restored from the backup and reloaded. More than `MAX_RECOVERY_ATTEMPTS`
/// recoveries is fatal.
pub fn revalidate() -> bool {
    // SAFETY: read of the static image; concurrent mutation only happens in
    // recover() below, which runs with interrupts disabled.
    let image = unsafe { *(&raw const GDT_IMAGE) };
    match validate_image(&image, GDT_CHECKSUM.load(Ordering::Acquire)) {
        Ok(()) => {
            CONSECUTIVE_FAILURES.store(0, Ordering::Relaxed);
            true
        }
        Err(fault) => {
            let failures = CONSECUTIVE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
            log::error!(
                "GDT integrity check failed ({:?}), {}/{} before recovery",
                fault,
                failures,
                FAILURES_BEFORE_RECOVERY
            );
            if failures >= FAILURES_BEFORE_RECOVERY {
                recover();
            }
            false
        }
    }
}

/// Restore the table from the backup and reload the CPU state.
fn recover() {
    let attempts = RECOVERY_ATTEMPTS.fetch_add(1, Ordering::Relaxed) + 1;
    if attempts > MAX_RECOVERY_ATTEMPTS {
        panic!("GDT corruption persists after {} recoveries", attempts - 1);
    }

    log::warn!("GDT recovery {}/{}", attempts, MAX_RECOVERY_ATTEMPTS);

    let flags = crate::arch::x86_64::save_flags_and_cli();
    // SAFETY: interrupts are disabled; backup was written once at init.
    unsafe {
        *(&raw mut GDT_IMAGE) = *(&raw const GDT_BACKUP);
        load();
    }
    crate::arch::x86_64::restore_flags(flags);

    CONSECUTIVE_FAILURES.store(0, Ordering::Relaxed);
    log::info!("GDT restored from backup");
}

/// Periodic-timer callback driving the revalidation.
pub fn integrity_check_callback(_ctx: *mut ()) {
    revalidate();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_code_descriptor_bits() {
        let desc = make_segment(KERNEL_CODE_ACCESS, CODE_FLAGS);
        assert_eq!((desc >> 40) as u8, 0x9A);
        assert_eq!(desc & 0xFFFF, 0xFFFF);
        // L bit (bit 53) set, base zero.
        assert_ne!(desc & (1 << 53), 0);
        assert_eq!((desc >> 16) & 0xFF_FFFF, 0);
    }

    #[test]
    fn test_tss_descriptor_encodes_base() {
        let base = 0xFFFF_8000_1234_5678u64;
        let (low, high) = make_tss_descriptor(base, 0x67);
        assert_eq!(low & 0xFFFF, 0x67);
        assert_eq!((low >> 16) & 0xFF_FFFF, base & 0xFF_FFFF);
        assert_eq!((low >> 56) & 0xFF, (base >> 24) & 0xFF);
        assert_eq!(high, base >> 32);
        assert_eq!((low >> 40) as u8, TSS_ACCESS);
    }

    #[test]
    fn test_validate_accepts_fresh_image() {
        let image = build_image(0x1000, 0x67);
        assert!(validate_image(&image, image_checksum(&image)).is_ok());
    }

    #[test]
    fn test_validate_detects_flipped_access_byte() {
        let mut image = build_image(0x1000, 0x67);
        let checksum = image_checksum(&image);
        image[1] ^= 1 << 40;
        assert_eq!(
            validate_image(&image, checksum),
            Err(GdtFault::KernelCodeAccess)
        );
    }

    #[test]
    fn test_validate_detects_silent_corruption() {
        let mut image = build_image(0x1000, 0x67);
        let checksum = image_checksum(&image);
        // A flipped base bit leaves every access byte intact: only the
        // checksum catches it.
        image[5] ^= 1 << 16;
        assert_eq!(validate_image(&image, checksum), Err(GdtFault::Checksum));
    }

    #[test]
    fn test_validate_detects_nonzero_null_descriptor() {
        let mut image = build_image(0x1000, 0x67);
        let checksum = image_checksum(&image);
        image[0] = 1;
        assert_eq!(
            validate_image(&image, checksum),
            Err(GdtFault::NullDescriptor)
        );
    }
}
