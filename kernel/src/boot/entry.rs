// BootInfo structures for bootloader handoff

/// Everything the core needs from the bootloader: a memory map, the HHDM
/// offset, the kernel load addresses, and (optionally) a framebuffer.
/// The CPU is already in 64-bit long mode with paging enabled.
#[repr(C, packed(8))]
pub struct BootInfo {
    pub kernel_phys_base: u64,
    pub kernel_virt_base: u64,
    pub memory_map_base: u64,
    pub memory_map_len: u64,
    pub framebuffer_addr: u64,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_stride: u32,
    pub framebuffer_bpp: u16,
    /// Higher Half Direct Map offset: physical address `p` is readable and
    /// writable at virtual address `p + hhdm_offset`.
    pub hhdm_offset: u64,
}

#[repr(C, packed(8))]
#[derive(Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub kind: MemoryKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum MemoryKind {
    Null = 0,
    Usable = 1,
    Reclaimable = 2,
    Reserved = 3,
    Acpi = 4,
    Kernel = 5,
    Framebuffer = 6,
}
