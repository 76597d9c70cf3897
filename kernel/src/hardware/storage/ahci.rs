//! AHCI (Advanced Host Controller Interface) driver — AHCI spec 1.3.1
//!
//! PCI: class=0x01 (Mass Storage), subclass=0x06 (SATA), prog_if=0x01
//! MMIO base: BAR5 (ABAR)
//!
//! Per-port DMA memory, allocated in two regions:
//!   metadata (3 pages):
//!     [0x0000..0x03FF]  Command List   (1024 B, 32 × 32-byte headers)
//!     [0x0400..0x04FF]  FIS receive    (256 B)
//!     [0x0500..0x24FF]  Command tables (32 × 256 B, CTBA pre-filled)
//!   staging (32 pages): 128 KiB DMA bounce buffer; larger transfers are
//!   chunked through it under the port lock.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use spin::Mutex;

use crate::arch::x86_64::pci::{self, Bar, ProbeCriteria};
use crate::arch::x86_64::pit::{self, PollResult};
use crate::memory::{self, frame::PhysFrame, paging::PageFlags, PAGE_SIZE};
use crate::sync::SpinLock;

// ─── HBA generic registers (at ABAR) ─────────────────────────────────────────
const HBA_CAP: u64 = 0x00;
const HBA_GHC: u64 = 0x04;
const HBA_PI: u64 = 0x0C;

const GHC_AE: u32 = 1 << 31; // AHCI Enable
const GHC_HR: u32 = 1 << 0; // HBA Reset

// ─── Port register offsets (port base = ABAR + 0x100 + n*0x80) ───────────────
const PORT_CLB: u64 = 0x00;
const PORT_CLBU: u64 = 0x04;
const PORT_FB: u64 = 0x08;
const PORT_FBU: u64 = 0x0C;
const PORT_IS: u64 = 0x10;
const PORT_CMD: u64 = 0x18;
const PORT_TFD: u64 = 0x20;
const PORT_SIG: u64 = 0x24;
const PORT_SSTS: u64 = 0x28;
const PORT_SERR: u64 = 0x30;
const PORT_SACT: u64 = 0x34;
const PORT_CI: u64 = 0x38;

const CMD_ST: u32 = 1 << 0; // Start
const CMD_FRE: u32 = 1 << 4; // FIS Receive Enable
const CMD_FR: u32 = 1 << 14; // FIS Receive Running
const CMD_CR: u32 = 1 << 15; // Command List Running

const TFD_BSY: u32 = 1 << 7;
const TFD_DRQ: u32 = 1 << 3;

const SSTS_DET_MASK: u32 = 0xF;
const SSTS_DET_COMM: u32 = 3; // device present, PHY established
const SSTS_IPM_MASK: u32 = 0xF00;
const SSTS_IPM_ACTIVE: u32 = 0x100;

const SIG_SATA: u32 = 0x0000_0101;

// ─── Per-port memory layout ──────────────────────────────────────────────────
const CLB_OFF: u64 = 0x0000; // Command List (1024 B)
const FB_OFF: u64 = 0x0400; // FIS buffer (256 B)
const CTAB_OFF: u64 = 0x0500; // Command tables
const CTAB_SIZE: u64 = 256; // bytes per command table
const META_PAGES: usize = 3;

const STAGING_PAGES: usize = 32;
const STAGING_BYTES: usize = STAGING_PAGES * PAGE_SIZE as usize; // 128 KiB

const COMMAND_SLOTS: usize = 32;

// Command header field byte offsets within a 32-byte slot
const CMDH_FLAGS: usize = 0; // u16: cfl[4:0] | a | w | p | r | b | c
const CMDH_PRDTL: usize = 2; // u16
const CMDH_CTBA: usize = 8; // u32
const CMDH_CTBAU: usize = 12; // u32

// Command table FIS and PRDT offsets
const CTAB_CFIS: usize = 0x00; // H2D FIS (64 B allocated)
const CTAB_PRDT: usize = 0x80; // PRDT entries

// H2D FIS field offsets (FIS type 0x27, Register Host-to-Device)
const FIS_TYPE: usize = 0;
const FIS_FLAGS: usize = 1; // PM port [3:0] | C [7]
const FIS_CMD: usize = 2;
const FIS_LBA0: usize = 4;
const FIS_LBA1: usize = 5;
const FIS_LBA2: usize = 6;
const FIS_DEVICE: usize = 7;
const FIS_LBA3: usize = 8;
const FIS_LBA4: usize = 9;
const FIS_LBA5: usize = 10;
const FIS_CNT_LO: usize = 12;
const FIS_CNT_HI: usize = 13;

const FIS_TYPE_H2D: u8 = 0x27;
const FIS_C_BIT: u8 = 0x80; // command (not control)
const FIS_LBA_MODE: u8 = 1 << 6;

// ATA commands
const ATA_IDENTIFY: u8 = 0xEC;
const ATA_READ_DMA_EXT: u8 = 0x25;
const ATA_WRITE_DMA_EXT: u8 = 0x35;
const ATA_READ_DMA: u8 = 0xC8;
const ATA_WRITE_DMA: u8 = 0xCA;
const ATA_FLUSH_CACHE_EXT: u8 = 0xEA;

// PxIS bit 30 = Task File Error Status
const PXIS_TFES: u32 = 1 << 30;

/// HBA register window: generic registers + 32 ports.
const ABAR_WINDOW_SIZE: u64 = 0x1100;

const RESET_TIMEOUT_MS: u64 = 1000;
const ENGINE_TIMEOUT_MS: u64 = 500;
const COMMAND_TIMEOUT_MS: u64 = 5000;

// ─── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AhciError {
    #[error("invalid BAR5 (ABAR)")]
    BadAbar,
    #[error("HBA reset timed out")]
    ResetTimeout,
    #[error("physical memory allocation failed")]
    Alloc,
    #[error("port BSY/DRQ set")]
    Busy,
    #[error("no free command slot")]
    NoSlot,
    #[error("command timed out")]
    Timeout,
    #[error("device reported task-file error")]
    DeviceError,
    #[error("invalid sector range")]
    InvalidSector,
    #[error("buffer is not a multiple of the sector size")]
    BadBuffer,
    #[error("no such port")]
    NoPort,
}

// ─── MMIO helpers ────────────────────────────────────────────────────────────

#[inline]
unsafe fn rd32(base: u64, off: u64) -> u32 {
    unsafe { ptr::read_volatile((base + off) as *const u32) }
}

#[inline]
unsafe fn wr32(base: u64, off: u64, val: u32) {
    unsafe { ptr::write_volatile((base + off) as *mut u32, val) }
}

// ─── Identify parsing (pure) ─────────────────────────────────────────────────

/// Geometry and strings from an ATA IDENTIFY block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IdentifyInfo {
    model: String,
    serial: String,
    firmware: String,
    sector_count: u64,
    sector_size: u32,
    lba48: bool,
}

fn identify_word(data: &[u8], word: usize) -> u16 {
    u16::from_le_bytes([data[word * 2], data[word * 2 + 1]])
}

/// ATA strings pack two characters per word with the bytes swapped.
fn ata_string(data: &[u8], start_word: usize, word_count: usize) -> String {
    let mut out = String::with_capacity(word_count * 2);
    for word in start_word..start_word + word_count {
        let value = identify_word(data, word);
        for b in [(value >> 8) as u8, (value & 0xFF) as u8] {
            out.push(if (0x20..=0x7E).contains(&b) {
                b as char
            } else {
                ' '
            });
        }
    }
    String::from(out.trim_end())
}

fn parse_identify(data: &[u8]) -> IdentifyInfo {
    let serial = ata_string(data, 10, 10);
    let firmware = ata_string(data, 23, 4);
    let model = ata_string(data, 27, 20);

    // Word 83 bit 10: 48-bit address feature set.
    let lba48 = identify_word(data, 83) & (1 << 10) != 0;
    let sector_count = if lba48 {
        (identify_word(data, 100) as u64)
            | ((identify_word(data, 101) as u64) << 16)
            | ((identify_word(data, 102) as u64) << 32)
            | ((identify_word(data, 103) as u64) << 48)
    } else {
        (identify_word(data, 60) as u64) | ((identify_word(data, 61) as u64) << 16)
    };

    // Word 106: logical sector size validity. Conservative: 512 B unless
    // the word is valid (bit 14 set, bit 15 clear) and bit 12 announces a
    // non-512 logical sector, in which case words 117-118 hold it in words.
    let w106 = identify_word(data, 106);
    let sector_size = if w106 & (1 << 14) != 0 && w106 & (1 << 15) == 0 && w106 & (1 << 12) != 0 {
        let words =
            (identify_word(data, 117) as u32) | ((identify_word(data, 118) as u32) << 16);
        (words * 2).max(512)
    } else {
        512
    };

    IdentifyInfo {
        model,
        serial,
        firmware,
        sector_count,
        sector_size,
        lba48,
    }
}

// ─── FIS / header construction (pure) ────────────────────────────────────────

/// Fill a 20-byte H2D register FIS for a command.
///
/// 48-bit commands place the upper LBA bytes in LBA3..LBA5; 28-bit commands
/// carry LBA[27:24] in the device register's low nibble instead.
fn build_h2d_fis(fis: &mut [u8], command: u8, lba: u64, count: u16, lba48: bool) {
    fis[FIS_TYPE] = FIS_TYPE_H2D;
    fis[FIS_FLAGS] = FIS_C_BIT;
    fis[FIS_CMD] = command;
    fis[FIS_LBA0] = (lba & 0xFF) as u8;
    fis[FIS_LBA1] = ((lba >> 8) & 0xFF) as u8;
    fis[FIS_LBA2] = ((lba >> 16) & 0xFF) as u8;
    if lba48 {
        fis[FIS_DEVICE] = FIS_LBA_MODE;
        fis[FIS_LBA3] = ((lba >> 24) & 0xFF) as u8;
        fis[FIS_LBA4] = ((lba >> 32) & 0xFF) as u8;
        fis[FIS_LBA5] = ((lba >> 40) & 0xFF) as u8;
    } else {
        fis[FIS_DEVICE] = FIS_LBA_MODE | ((lba >> 24) & 0xF) as u8;
    }
    fis[FIS_CNT_LO] = (count & 0xFF) as u8;
    fis[FIS_CNT_HI] = (count >> 8) as u8;
}

/// Command header flags: CFL = 5 dwords (20-byte H2D FIS), W for writes.
fn header_flags(write: bool) -> u16 {
    5u16 | if write { 1 << 6 } else { 0 }
}

// ─── Internal port handle ────────────────────────────────────────────────────

struct AhciPort {
    num: u8,
    /// Virtual address of this port's registers.
    regs: u64,
    meta_frames: PhysFrame,
    meta_phys: u64,
    meta_virt: u64,
    staging_frames: PhysFrame,
    staging_phys: u64,
    staging_virt: u64,
    slot_count: u8,
    model: String,
    serial: String,
    firmware: String,
    sector_count: u64,
    sector_size: u32,
    lba48: bool,
}

// SAFETY: a port is only touched under its SpinLock.
unsafe impl Send for AhciPort {}

impl AhciPort {
    /// Stop the command engine: clear ST, wait CR=0, clear FRE, wait FR=0.
    fn stop_engine(&self) -> Result<(), AhciError> {
        // SAFETY: self.regs is a mapped MMIO port register window.
        unsafe {
            let cmd = rd32(self.regs, PORT_CMD);
            wr32(self.regs, PORT_CMD, cmd & !CMD_ST);
        }
        if pit::deadline_poll(
            || unsafe { rd32(self.regs, PORT_CMD) } & CMD_CR == 0,
            1,
            ENGINE_TIMEOUT_MS,
        ) == PollResult::TimedOut
        {
            return Err(AhciError::Timeout);
        }

        // SAFETY: as above.
        unsafe {
            let cmd = rd32(self.regs, PORT_CMD);
            wr32(self.regs, PORT_CMD, cmd & !CMD_FRE);
        }
        if pit::deadline_poll(
            || unsafe { rd32(self.regs, PORT_CMD) } & CMD_FR == 0,
            1,
            ENGINE_TIMEOUT_MS,
        ) == PollResult::TimedOut
        {
            return Err(AhciError::Timeout);
        }
        Ok(())
    }

    /// Start the command engine: FRE first, then ST.
    fn start_engine(&self) {
        // SAFETY: self.regs is a mapped MMIO port register window.
        unsafe {
            let cmd = rd32(self.regs, PORT_CMD);
            wr32(self.regs, PORT_CMD, cmd | CMD_FRE);
            let cmd = rd32(self.regs, PORT_CMD);
            wr32(self.regs, PORT_CMD, cmd | CMD_ST);
        }
    }

    /// Pre-fill each command header's CTBA with its table's address.
    fn init_command_list(&self) {
        for slot in 0..COMMAND_SLOTS {
            let header = (self.meta_virt + CLB_OFF + slot as u64 * 32) as *mut u8;
            let table_phys = self.meta_phys + CTAB_OFF + slot as u64 * CTAB_SIZE;
            // SAFETY: header points into our zeroed metadata region.
            unsafe {
                ptr::write_unaligned(
                    header.add(CMDH_CTBA) as *mut u32,
                    (table_phys & 0xFFFF_FFFF) as u32,
                );
                ptr::write_unaligned(header.add(CMDH_CTBAU) as *mut u32, (table_phys >> 32) as u32);
            }
        }
    }

    /// Find a slot with both CI and SACT clear.
    fn free_slot(&self) -> Option<usize> {
        // SAFETY: MMIO reads.
        let busy = unsafe { rd32(self.regs, PORT_CI) | rd32(self.regs, PORT_SACT) };
        (0..self.slot_count as usize).find(|&slot| busy & (1 << slot) == 0)
    }

    /// Issue one command through the staging buffer and poll it to
    /// completion. `data_len` bytes are transferred when non-zero.
    fn issue(
        &self,
        ata_cmd: u8,
        lba: u64,
        count: u16,
        data_len: usize,
        write: bool,
    ) -> Result<(), AhciError> {
        debug_assert!(data_len <= STAGING_BYTES);

        // SAFETY: MMIO read to check device readiness.
        let tfd = unsafe { rd32(self.regs, PORT_TFD) };
        if tfd & (TFD_BSY | TFD_DRQ) != 0 {
            return Err(AhciError::Busy);
        }

        let slot = self.free_slot().ok_or(AhciError::NoSlot)?;
        let header = (self.meta_virt + CLB_OFF + slot as u64 * 32) as *mut u8;
        let table = (self.meta_virt + CTAB_OFF + slot as u64 * CTAB_SIZE) as *mut u8;
        let table_phys = self.meta_phys + CTAB_OFF + slot as u64 * CTAB_SIZE;
        let has_data = data_len > 0;

        // SAFETY: header/table point into our metadata region; offsets stay
        // inside the 32-byte header and 256-byte table.
        unsafe {
            // Command header (leave CTBA/CTBAU as pre-filled)
            ptr::write_unaligned(header.add(CMDH_FLAGS) as *mut u16, header_flags(write).to_le());
            ptr::write_unaligned(
                header.add(CMDH_PRDTL) as *mut u16,
                (has_data as u16).to_le(),
            );
            ptr::write_unaligned(header.add(CMDH_CTBA) as *mut u32, (table_phys & 0xFFFF_FFFF) as u32);
            ptr::write_unaligned(header.add(CMDH_CTBAU) as *mut u32, (table_phys >> 32) as u32);

            // Command table: zero, then H2D FIS + PRDT[0]
            ptr::write_bytes(table, 0, CTAB_SIZE as usize);
            let fis = core::slice::from_raw_parts_mut(table.add(CTAB_CFIS), 20);
            let ext = matches!(
                ata_cmd,
                ATA_READ_DMA_EXT | ATA_WRITE_DMA_EXT | ATA_FLUSH_CACHE_EXT
            );
            build_h2d_fis(fis, ata_cmd, lba, count, ext);

            if has_data {
                let prdt = table.add(CTAB_PRDT);
                ptr::write_unaligned(prdt as *mut u32, (self.staging_phys & 0xFFFF_FFFF) as u32);
                ptr::write_unaligned(prdt.add(4) as *mut u32, (self.staging_phys >> 32) as u32);
                ptr::write_unaligned(prdt.add(8) as *mut u32, 0u32);
                // DBC is 0-based; bit 31 = interrupt on completion.
                let dbc = (data_len as u32 - 1) | (1 << 31);
                ptr::write_unaligned(prdt.add(12) as *mut u32, dbc);
            }
        }

        // Issue: the structures must be visible before CI is set.
        crate::arch::x86_64::io::barrier();
        // SAFETY: MMIO write to PxCI.
        unsafe { wr32(self.regs, PORT_CI, 1 << slot) };

        let mut task_file_error = false;
        let result = pit::deadline_poll(
            || {
                // SAFETY: MMIO reads.
                let is = unsafe { rd32(self.regs, PORT_IS) };
                if is & PXIS_TFES != 0 {
                    task_file_error = true;
                    return true;
                }
                let ci = unsafe { rd32(self.regs, PORT_CI) };
                ci & (1 << slot) == 0
            },
            1,
            COMMAND_TIMEOUT_MS,
        );

        if task_file_error {
            // Clear the error state so the port can continue: IS first,
            // then SERR.
            // SAFETY: MMIO writes.
            unsafe {
                wr32(self.regs, PORT_IS, 0xFFFF_FFFF);
                wr32(self.regs, PORT_SERR, 0xFFFF_FFFF);
            }
            return Err(AhciError::DeviceError);
        }
        if result == PollResult::TimedOut {
            return Err(AhciError::Timeout);
        }

        // SAFETY: MMIO write to clear port interrupt status.
        unsafe { wr32(self.regs, PORT_IS, 0xFFFF_FFFF) };
        Ok(())
    }

    fn staging(&self) -> *mut u8 {
        self.staging_virt as *mut u8
    }

    /// Release the port's DMA memory (engine must already be stopped).
    fn release(self) {
        memory::free_frames(self.meta_frames, META_PAGES);
        memory::free_frames(self.staging_frames, STAGING_PAGES);
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct AhciController {
    abar_phys: u64,
    abar_virt: u64,
    ports_impl: u32,
    ports_active: u32,
    slot_count: u8,
    ports: Vec<SpinLock<AhciPort>>,
    pub name: String,
}

// SAFETY: port access goes through per-port SpinLocks; the HBA registers
// are only mutated during init/shutdown.
unsafe impl Send for AhciController {}
unsafe impl Sync for AhciController {}

impl AhciController {
    /// Probe and initialise an AHCI controller from the PCI bus.
    ///
    /// # Safety
    /// Must be called once per device during kernel init (maps MMIO).
    unsafe fn new(pci_dev: &pci::PciDevice, name: String) -> Result<Self, AhciError> {
        pci_dev.enable_device();

        // BAR5 = ABAR (AHCI Base Memory Register)
        let abar_phys = match pci_dev.read_bar(5) {
            Some(Bar::Memory64 { addr, .. }) => addr,
            Some(Bar::Memory32 { addr, .. }) => addr as u64,
            _ => return Err(AhciError::BadAbar),
        };
        if abar_phys == 0 {
            return Err(AhciError::BadAbar);
        }

        let abar_virt = memory::paging::map_physical(
            abar_phys,
            ABAR_WINDOW_SIZE,
            PageFlags::WRITABLE | PageFlags::NOCACHE,
        )
        .ok_or(AhciError::Alloc)?;

        // HBA reset: set GHC.HR and wait for it to self-clear.
        unsafe {
            let ghc = rd32(abar_virt, HBA_GHC);
            wr32(abar_virt, HBA_GHC, ghc | GHC_HR);
        }
        if pit::deadline_poll(
            || unsafe { rd32(abar_virt, HBA_GHC) } & GHC_HR == 0,
            1,
            RESET_TIMEOUT_MS,
        ) == PollResult::TimedOut
        {
            memory::paging::unmap_physical(abar_virt, ABAR_WINDOW_SIZE);
            return Err(AhciError::ResetTimeout);
        }

        // Enable AHCI mode.
        unsafe {
            let ghc = rd32(abar_virt, HBA_GHC);
            wr32(abar_virt, HBA_GHC, ghc | GHC_AE);
        }

        let cap = unsafe { rd32(abar_virt, HBA_CAP) };
        let slot_count = (((cap >> 8) & 0x1F) + 1).min(COMMAND_SLOTS as u32) as u8;
        let ports_impl = unsafe { rd32(abar_virt, HBA_PI) };

        log::debug!(
            "AHCI: ABAR phys={:#x} virt={:#x} PI={:#010x} slots={}",
            abar_phys,
            abar_virt,
            ports_impl,
            slot_count
        );

        let mut controller = Self {
            abar_phys,
            abar_virt,
            ports_impl,
            ports_active: 0,
            slot_count,
            ports: Vec::new(),
            name,
        };

        for port_num in 0..32u8 {
            if ports_impl & (1 << port_num) == 0 {
                continue;
            }
            match controller.init_port(port_num) {
                Ok(Some(port)) => {
                    controller.ports_active |= 1 << port_num;
                    controller.ports.push(SpinLock::new(port));
                }
                Ok(None) => {}
                Err(e) => log::warn!("AHCI: port {} init failed: {}", port_num, e),
            }
        }

        if controller.ports.is_empty() {
            log::info!("AHCI: controller has no usable SATA ports");
        }

        Ok(controller)
    }

    /// Bring up one implemented port. `Ok(None)` means no usable device.
    fn init_port(&self, port_num: u8) -> Result<Option<AhciPort>, AhciError> {
        let regs = self.abar_virt + 0x100 + port_num as u64 * 0x80;

        // Gate on SSTS: device present with PHY communication, link active.
        // SAFETY: regs is a mapped port register window.
        let ssts = unsafe { rd32(regs, PORT_SSTS) };
        if ssts & SSTS_DET_MASK != SSTS_DET_COMM {
            return Ok(None);
        }
        if ssts & SSTS_IPM_MASK != SSTS_IPM_ACTIVE {
            log::debug!("AHCI: port {} IPM not active, skipping", port_num);
            return Ok(None);
        }

        // Only plain SATA devices (no ATAPI/port multipliers).
        let sig = unsafe { rd32(regs, PORT_SIG) };
        if sig != SIG_SATA {
            log::debug!("AHCI: port {} sig={:#010x} — not SATA, skipping", port_num, sig);
            return Ok(None);
        }

        let meta_frames = memory::allocate_dma_frames(META_PAGES).ok_or(AhciError::Alloc)?;
        let staging_frames = match memory::allocate_dma_frames(STAGING_PAGES) {
            Some(f) => f,
            None => {
                memory::free_frames(meta_frames, META_PAGES);
                return Err(AhciError::Alloc);
            }
        };

        let meta_phys = meta_frames.as_u64();
        let staging_phys = staging_frames.as_u64();
        let mut port = AhciPort {
            num: port_num,
            regs,
            meta_frames,
            meta_phys,
            meta_virt: memory::phys_to_virt(meta_phys),
            staging_frames,
            staging_phys,
            staging_virt: memory::phys_to_virt(staging_phys),
            slot_count: self.slot_count,
            model: String::new(),
            serial: String::new(),
            firmware: String::new(),
            sector_count: 0,
            sector_size: 512,
            lba48: false,
        };

        if let Err(e) = port.stop_engine() {
            port.release();
            return Err(e);
        }

        port.init_command_list();

        let clb = meta_phys + CLB_OFF;
        let fb = meta_phys + FB_OFF;
        // SAFETY: MMIO writes; the addresses point at our DMA metadata.
        unsafe {
            wr32(regs, PORT_CLB, (clb & 0xFFFF_FFFF) as u32);
            wr32(regs, PORT_CLBU, (clb >> 32) as u32);
            wr32(regs, PORT_FB, (fb & 0xFFFF_FFFF) as u32);
            wr32(regs, PORT_FBU, (fb >> 32) as u32);
            // Clear stale status: IS first, then SERR.
            wr32(regs, PORT_IS, 0xFFFF_FFFF);
            wr32(regs, PORT_SERR, 0xFFFF_FFFF);
        }

        port.start_engine();

        // ATA IDENTIFY: 512 B into the staging buffer.
        match port.issue(ATA_IDENTIFY, 0, 0, 512, false) {
            Ok(()) => {
                // SAFETY: the staging buffer holds 512 identify bytes.
                let data =
                    unsafe { core::slice::from_raw_parts(port.staging() as *const u8, 512) };
                let info = parse_identify(data);
                log::info!(
                    "AHCI: port {} {} — {} sectors of {} B ({} MiB){}",
                    port_num,
                    info.model,
                    info.sector_count,
                    info.sector_size,
                    info.sector_count * info.sector_size as u64 / (1024 * 1024),
                    if info.lba48 { ", LBA48" } else { "" }
                );
                port.model = info.model;
                port.serial = info.serial;
                port.firmware = info.firmware;
                port.sector_count = info.sector_count;
                port.sector_size = info.sector_size;
                port.lba48 = info.lba48;
                Ok(Some(port))
            }
            Err(e) => {
                log::warn!("AHCI: port {} IDENTIFY failed: {}", port_num, e);
                let _ = port.stop_engine();
                port.release();
                Ok(None)
            }
        }
    }

    /// Number of ports with a working device.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn ports_implemented(&self) -> u32 {
        self.ports_impl
    }

    pub fn ports_active(&self) -> u32 {
        self.ports_active
    }

    fn port(&self, index: usize) -> Result<&SpinLock<AhciPort>, AhciError> {
        self.ports.get(index).ok_or(AhciError::NoPort)
    }

    /// Sector count / sector size of a port.
    pub fn geometry(&self, index: usize) -> Option<(u64, u32)> {
        self.ports.get(index).map(|p| {
            let p = p.lock();
            (p.sector_count, p.sector_size)
        })
    }

    /// Read `buffer.len() / sector_size` sectors starting at `lba`.
    /// Transfers larger than the staging buffer are split into back-to-back
    /// commands under the port lock.
    pub fn read(&self, index: usize, lba: u64, buffer: &mut [u8]) -> Result<(), AhciError> {
        let port = self.port(index)?.lock();
        let sector_size = port.sector_size as usize;
        let sectors = check_range(&port, lba, buffer.len())?;
        let max_sectors = (STAGING_BYTES / sector_size) as u64;
        let read_cmd = if port.lba48 { ATA_READ_DMA_EXT } else { ATA_READ_DMA };

        let mut done = 0u64;
        while done < sectors {
            let chunk = (sectors - done).min(max_sectors);
            let bytes = chunk as usize * sector_size;
            port.issue(read_cmd, lba + done, chunk as u16, bytes, false)?;
            // SAFETY: staging holds `bytes` fresh bytes; the destination
            // slice spans them.
            unsafe {
                ptr::copy_nonoverlapping(
                    port.staging() as *const u8,
                    buffer[done as usize * sector_size..].as_mut_ptr(),
                    bytes,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `buffer.len() / sector_size` sectors starting at `lba`.
    pub fn write(&self, index: usize, lba: u64, buffer: &[u8]) -> Result<(), AhciError> {
        let port = self.port(index)?.lock();
        let sector_size = port.sector_size as usize;
        let sectors = check_range(&port, lba, buffer.len())?;
        let max_sectors = (STAGING_BYTES / sector_size) as u64;
        let write_cmd = if port.lba48 { ATA_WRITE_DMA_EXT } else { ATA_WRITE_DMA };

        let mut done = 0u64;
        while done < sectors {
            let chunk = (sectors - done).min(max_sectors);
            let bytes = chunk as usize * sector_size;
            // SAFETY: staging spans STAGING_BYTES >= bytes.
            unsafe {
                ptr::copy_nonoverlapping(
                    buffer[done as usize * sector_size..].as_ptr(),
                    port.staging(),
                    bytes,
                );
            }
            port.issue(write_cmd, lba + done, chunk as u16, bytes, true)?;
            done += chunk;
        }
        Ok(())
    }

    /// Flush the device's write cache.
    pub fn flush(&self, index: usize) -> Result<(), AhciError> {
        let port = self.port(index)?.lock();
        port.issue(ATA_FLUSH_CACHE_EXT, 0, 0, 0, false)
    }

    /// One-line description of a port's device.
    pub fn describe(&self, index: usize) -> Option<String> {
        self.ports.get(index).map(|p| {
            let p = p.lock();
            format!(
                "{} port {}: {} (SN {}, FW {})",
                self.name, p.num, p.model, p.serial, p.firmware
            )
        })
    }

    /// Stop every port engine and release all DMA memory and the ABAR
    /// mapping.
    pub fn shutdown(mut self) {
        for port_lock in self.ports.drain(..) {
            // The SpinLock is ours by value; nobody else can hold it.
            let port = port_lock.into_inner();
            let _ = port.stop_engine();
            port.release();
        }
        memory::paging::unmap_physical(self.abar_virt, ABAR_WINDOW_SIZE);
        log::info!("AHCI: {} shut down (ABAR {:#x} released)", self.name, self.abar_phys);
    }
}

fn check_range(port: &AhciPort, lba: u64, buffer_len: usize) -> Result<u64, AhciError> {
    let sector_size = port.sector_size as usize;
    if buffer_len == 0 || buffer_len % sector_size != 0 {
        return Err(AhciError::BadBuffer);
    }
    let sectors = (buffer_len / sector_size) as u64;
    if lba
        .checked_add(sectors)
        .map_or(true, |end| end > port.sector_count)
    {
        return Err(AhciError::InvalidSector);
    }
    if !port.lba48 && lba + sectors > (1 << 28) {
        return Err(AhciError::InvalidSector);
    }
    Ok(sectors)
}

// ─── Registry + public init ──────────────────────────────────────────────────

static AHCI_CONTROLLERS: Mutex<Vec<Arc<AhciController>>> = Mutex::new(Vec::new());

/// Scan the PCI bus for AHCI controllers and initialise each one.
pub fn init() {
    log::info!("[AHCI] Scanning for AHCI controllers...");

    let candidates = pci::probe_all(ProbeCriteria {
        class_code: Some(pci::class::MASS_STORAGE),
        subclass: Some(pci::storage_subclass::SATA),
        prog_if: Some(pci::sata_progif::AHCI),
        ..ProbeCriteria::any()
    });

    for (i, pci_dev) in candidates.into_iter().enumerate() {
        log::info!(
            "AHCI: found controller at {:?} (VEN:{:04x} DEV:{:04x})",
            pci_dev.address,
            pci_dev.vendor_id,
            pci_dev.device_id
        );

        let name = format!("ahci{}", i);
        match unsafe { AhciController::new(&pci_dev, name) } {
            Ok(controller) => {
                AHCI_CONTROLLERS.lock().push(Arc::new(controller));
            }
            Err(e) => log::warn!("AHCI: failed to initialize controller: {}", e),
        }
    }

    log::info!("[AHCI] {} controller(s) ready", AHCI_CONTROLLERS.lock().len());
}

pub fn controller_count() -> usize {
    AHCI_CONTROLLERS.lock().len()
}

pub fn get_controller(index: usize) -> Option<Arc<AhciController>> {
    AHCI_CONTROLLERS.lock().get(index).cloned()
}

pub fn get_first_controller() -> Option<Arc<AhciController>> {
    AHCI_CONTROLLERS.lock().first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_block(model: &str, sectors48: u64) -> alloc::vec::Vec<u8> {
        let mut data = alloc::vec![0u8; 512];
        // Model: words 27..47, two byte-swapped chars per word.
        let mut padded = alloc::vec![b' '; 40];
        padded[..model.len()].copy_from_slice(model.as_bytes());
        for (i, pair) in padded.chunks(2).enumerate() {
            data[(27 + i) * 2] = pair[1];
            data[(27 + i) * 2 + 1] = pair[0];
        }
        // Serial words 10..20
        let serial = b"QM00001             ";
        for (i, pair) in serial.chunks(2).take(10).enumerate() {
            data[(10 + i) * 2] = pair[1];
            data[(10 + i) * 2 + 1] = pair[0];
        }
        // 48-bit support: word 83 bit 10; count in words 100..104.
        data[83 * 2 + 1] = 0x04;
        data[100 * 2..100 * 2 + 8].copy_from_slice(&sectors48.to_le_bytes());
        data
    }

    #[test]
    fn test_ata_string_byte_swap_and_trim() {
        let data = identify_block("QEMU HARDDISK", 0x1000);
        let model = ata_string(&data, 27, 20);
        assert_eq!(model, "QEMU HARDDISK");
        // No control characters, no trailing spaces.
        assert!(model.bytes().all(|b| (0x20..=0x7E).contains(&b)));
        assert!(!model.ends_with(' '));
    }

    #[test]
    fn test_parse_identify_lba48() {
        let data = identify_block("QEMU HARDDISK", 204800);
        let info = parse_identify(&data);
        assert!(info.lba48);
        assert_eq!(info.sector_count, 204800);
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.serial, "QM00001");
    }

    #[test]
    fn test_parse_identify_28bit_fallback() {
        let mut data = identify_block("OLD DISK", 0);
        data[83 * 2 + 1] = 0; // no 48-bit feature set
        data[60 * 2..60 * 2 + 4].copy_from_slice(&1000u32.to_le_bytes());
        let info = parse_identify(&data);
        assert!(!info.lba48);
        assert_eq!(info.sector_count, 1000);
    }

    #[test]
    fn test_h2d_fis_layout() {
        let mut fis = [0u8; 20];
        build_h2d_fis(&mut fis, ATA_READ_DMA_EXT, 0x0123_4567_89AB, 0x0102, true);
        assert_eq!(fis[FIS_TYPE], 0x27);
        assert_eq!(fis[FIS_FLAGS], 0x80);
        assert_eq!(fis[FIS_CMD], 0x25);
        assert_eq!(fis[FIS_LBA0], 0xAB);
        assert_eq!(fis[FIS_LBA1], 0x89);
        assert_eq!(fis[FIS_LBA2], 0x67);
        assert_eq!(fis[FIS_LBA3], 0x45);
        assert_eq!(fis[FIS_LBA4], 0x23);
        assert_eq!(fis[FIS_LBA5], 0x01);
        assert_eq!(fis[FIS_DEVICE], 1 << 6);
        assert_eq!(fis[FIS_CNT_LO], 0x02);
        assert_eq!(fis[FIS_CNT_HI], 0x01);
    }

    #[test]
    fn test_h2d_fis_28bit_device_nibble() {
        let mut fis = [0u8; 20];
        build_h2d_fis(&mut fis, ATA_READ_DMA, 0x0F12_3456, 1, false);
        assert_eq!(fis[FIS_DEVICE], (1 << 6) | 0x0F);
        assert_eq!(fis[FIS_LBA3], 0);
    }

    #[test]
    fn test_header_flags() {
        assert_eq!(header_flags(false), 5);
        assert_eq!(header_flags(true), 5 | (1 << 6));
    }

    #[test]
    fn test_chunk_split_boundary() {
        // One sector beyond the staging capacity needs exactly two commands.
        let max_sectors = (STAGING_BYTES / 512) as u64;
        let total = max_sectors + 1;
        let mut commands = 0;
        let mut done = 0u64;
        while done < total {
            let chunk = (total - done).min(max_sectors);
            done += chunk;
            commands += 1;
        }
        assert_eq!(commands, 2);
    }
}
