//! Limine Boot Protocol entry point
//!
//! This module handles the kernel entry from the Limine bootloader.
//! Limine loads us directly in 64-bit long mode with paging enabled and
//! provides the memory map, the HHDM offset and the kernel load address.

use limine::{request::*, BaseRevision};

use super::entry::{BootInfo, MemoryKind, MemoryRegion};
use crate::serial_println;

/// Sets the base revision to the latest revision supported by the crate.
#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Request the memory map
#[used]
#[link_section = ".requests"]
static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

/// Request the framebuffer
#[used]
#[link_section = ".requests"]
static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

/// Request the kernel address
#[used]
#[link_section = ".requests"]
static EXECUTABLE_ADDRESS: ExecutableAddressRequest = ExecutableAddressRequest::new();

/// Request the HHDM (Higher Half Direct Map)
#[used]
#[link_section = ".requests"]
static HHDM: HhdmRequest = HhdmRequest::new();

/// Request the stack size
#[used]
#[link_section = ".requests"]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(0x10000); // 64KB

const MAX_BOOT_MEMORY_REGIONS: usize = 256;

static mut BOOT_MEMORY_MAP: [MemoryRegion; MAX_BOOT_MEMORY_REGIONS] = [MemoryRegion {
    base: 0,
    size: 0,
    kind: MemoryKind::Null,
}; MAX_BOOT_MEMORY_REGIONS];
static mut BOOT_INFO: BootInfo = BootInfo {
    kernel_phys_base: 0,
    kernel_virt_base: 0,
    memory_map_base: 0,
    memory_map_len: 0,
    framebuffer_addr: 0,
    framebuffer_width: 0,
    framebuffer_height: 0,
    framebuffer_stride: 0,
    framebuffer_bpp: 0,
    hhdm_offset: 0,
};

fn translate_entry_type(entry_type: limine::memory_map::EntryType) -> MemoryKind {
    use limine::memory_map::EntryType;
    if entry_type == EntryType::USABLE {
        MemoryKind::Usable
    } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
        MemoryKind::Reclaimable
    } else if entry_type == EntryType::ACPI_RECLAIMABLE || entry_type == EntryType::ACPI_NVS {
        MemoryKind::Acpi
    } else if entry_type == EntryType::EXECUTABLE_AND_MODULES {
        MemoryKind::Kernel
    } else if entry_type == EntryType::FRAMEBUFFER {
        MemoryKind::Framebuffer
    } else {
        MemoryKind::Reserved
    }
}

/// Limine entry point. Collects the bootloader responses into a `BootInfo`
/// and hands control to `kernel_main`.
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    let info = &raw mut BOOT_INFO;

    let hhdm = HHDM
        .get_response()
        .expect("Limine did not provide an HHDM offset");
    (*info).hhdm_offset = hhdm.offset();

    if let Some(addr) = EXECUTABLE_ADDRESS.get_response() {
        (*info).kernel_phys_base = addr.physical_base();
        (*info).kernel_virt_base = addr.virtual_base();
    }

    if let Some(fb_response) = FRAMEBUFFER.get_response() {
        if let Some(fb) = fb_response.framebuffers().next() {
            (*info).framebuffer_addr = fb.addr() as u64;
            (*info).framebuffer_width = fb.width() as u32;
            (*info).framebuffer_height = fb.height() as u32;
            (*info).framebuffer_stride = fb.pitch() as u32;
            (*info).framebuffer_bpp = fb.bpp();
        }
    }

    let mmap = MEMORY_MAP
        .get_response()
        .expect("Limine did not provide a memory map");
    let map = &raw mut BOOT_MEMORY_MAP;
    let mut len = 0usize;
    for entry in mmap.entries().iter() {
        if len >= MAX_BOOT_MEMORY_REGIONS {
            serial_println!("[boot] memory map truncated to {} regions", len);
            break;
        }
        (*map)[len] = MemoryRegion {
            base: entry.base,
            size: entry.length,
            kind: translate_entry_type(entry.entry_type),
        };
        len += 1;
    }
    (*info).memory_map_base = map as u64;
    (*info).memory_map_len = len as u64;

    crate::kernel_main(&*info)
}
