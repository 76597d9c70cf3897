// NVMe block device driver
// Reference: NVM Express Base Specification 2.0

mod command;
mod queue;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use spin::Mutex;

use crate::arch::x86_64::pci::{self, Bar, ProbeCriteria};
use crate::arch::x86_64::pit::{self, PollResult};
use crate::memory::{self, paging::PageFlags, PAGE_SIZE};

use command::*;
use queue::QueuePair;

const NVME_PAGE_SIZE: usize = 4096;

/// BAR0 window: generic registers plus enough doorbell space for the admin
/// queue and one I/O queue at the largest stride.
const MMIO_WINDOW_SIZE: u64 = 16 * 1024;

const ADMIN_QUEUE_ENTRIES: usize = 64;
const IO_QUEUE_ENTRIES: usize = 64;
const IO_QUEUE_ID: u16 = 1;

/// Largest namespace table we keep per controller.
const MAX_NAMESPACES: u32 = 16;

const IDENTIFY_TIMEOUT_MS: u64 = 5000;
const IO_TIMEOUT_MS: u64 = 5000;

/// Largest transfer per command: two PRP entries, no PRP list.
const MAX_BYTES_PER_COMMAND: usize = 2 * NVME_PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NvmeError {
    #[error("invalid BAR0")]
    BadBar,
    #[error("DMA memory allocation failed")]
    Alloc,
    #[error("controller fatal status (CSTS.CFS)")]
    ControllerFatal,
    #[error("submission queue full")]
    QueueFull,
    #[error("operation timed out")]
    Timeout,
    #[error("no such namespace")]
    InvalidNamespace,
    #[error("LBA out of range")]
    InvalidLba,
    #[error("buffer is not a multiple of the block size")]
    BadBuffer,
    #[error("device reported an error")]
    DeviceError,
}

#[repr(transparent)]
struct VolatileCell<T> {
    value: T,
}

impl<T> VolatileCell<T> {
    fn read(&self) -> T
    where
        T: Copy,
    {
        unsafe { ptr::read_volatile(&self.value) }
    }

    #[allow(invalid_reference_casting)]
    fn write(&self, val: T) {
        unsafe { ptr::write_volatile(&self.value as *const T as *mut T, val) }
    }
}

unsafe impl<T: Send> Send for VolatileCell<T> {}
unsafe impl<T: Sync> Sync for VolatileCell<T> {}

#[repr(C)]
struct Capability {
    value: VolatileCell<u64>,
}

impl Capability {
    fn max_queue_entries(&self) -> u16 {
        (self.value.read() & 0xFFFF) as u16
    }

    /// Worst-case enable/disable latency in milliseconds (CAP.TO is in
    /// 500 ms units).
    fn timeout_ms(&self) -> u64 {
        ((self.value.read() >> 24) & 0xFF) * 500
    }

    /// Doorbell stride in bytes: 4 << CAP.DSTRD.
    fn doorbell_stride(&self) -> u64 {
        4 << ((self.value.read() >> 32) & 0xF)
    }

    /// Minimum memory page size shift: 12 + CAP.MPSMIN.
    fn min_page_shift(&self) -> u8 {
        (12 + ((self.value.read() >> 48) & 0xF)) as u8
    }
}

#[repr(transparent)]
struct Version {
    value: VolatileCell<u32>,
}

#[repr(C)]
struct ControllerConfig {
    value: VolatileCell<u32>,
}

impl ControllerConfig {
    fn set_iosqes(&self, size: u32) {
        let mut val = self.value.read();
        val = (val & !(0xF << 16)) | ((size & 0xF) << 16);
        self.value.write(val);
    }

    fn set_iocqes(&self, size: u32) {
        let mut val = self.value.read();
        val = (val & !(0xF << 20)) | ((size & 0xF) << 20);
        self.value.write(val);
    }

    fn set_css(&self, css: u32) {
        let mut val = self.value.read();
        val = (val & !(0x7 << 4)) | ((css & 0x7) << 4);
        self.value.write(val);
    }

    fn set_mps(&self, mps: u32) {
        let mut val = self.value.read();
        val = (val & !(0xF << 7)) | ((mps & 0xF) << 7);
        self.value.write(val);
    }

    fn set_enable(&self, enable: bool) {
        let mut val = self.value.read();
        if enable {
            val |= 1;
        } else {
            val &= !1;
        }
        self.value.write(val);
    }

    fn is_enabled(&self) -> bool {
        (self.value.read() & 1) != 0
    }

    /// Shutdown notification (bits 15:14): 01 = normal shutdown.
    fn set_shutdown_normal(&self) {
        let mut val = self.value.read();
        val = (val & !(0x3 << 14)) | (0x1 << 14);
        self.value.write(val);
    }
}

#[repr(transparent)]
struct ControllerStatus {
    value: VolatileCell<u32>,
}

impl ControllerStatus {
    fn is_ready(&self) -> bool {
        (self.value.read() & 1) != 0
    }

    fn is_fatal(&self) -> bool {
        (self.value.read() >> 1) & 1 != 0
    }

    /// Shutdown status (bits 3:2): 10 = shutdown complete.
    fn shutdown_complete(&self) -> bool {
        (self.value.read() >> 2) & 0x3 == 0x2
    }
}

#[repr(C)]
struct Registers {
    capability: Capability,
    version: Version,
    intms: VolatileCell<u32>,
    intmc: VolatileCell<u32>,
    cc: ControllerConfig,
    _reserved1: VolatileCell<u32>,
    csts: ControllerStatus,
    _nssr: VolatileCell<u32>,
    aqa: VolatileCell<u32>,
    asq: VolatileCell<u64>,
    acq: VolatileCell<u64>,
}

#[derive(Debug, Clone)]
pub struct NvmeNamespace {
    pub nsid: u32,
    /// Logical block count.
    pub size: u64,
    /// Logical block size in bytes (power of two).
    pub block_size: u32,
}

/// Identify Controller fields the driver keeps.
struct ControllerIdentity {
    serial: String,
    model: String,
    firmware: String,
    namespace_count: u32,
    mdts: u8,
}

pub struct NvmeController {
    mmio_phys: u64,
    mmio_virt: u64,
    doorbell_stride: u64,
    max_transfer_bytes: usize,
    admin_queue: Mutex<QueuePair>,
    io_queue: Option<Mutex<QueuePair>>,
    /// Set when I/O queue creation failed and data commands run on the
    /// admin queue instead (some emulators never create I/O queues cleanly).
    use_admin_for_io: bool,
    namespaces: Vec<NvmeNamespace>,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub name: String,
}

// SAFETY: register access is volatile and queue state is behind Mutexes.
unsafe impl Send for NvmeController {}
unsafe impl Sync for NvmeController {}

/// Trim a space-padded ASCII identify field.
fn parse_nvme_string(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .map(|&b| {
            if (0x20..=0x7E).contains(&b) {
                b as char
            } else {
                ' '
            }
        })
        .collect();
    String::from(text.trim_end())
}

/// Parse the Identify Controller page (CNS=1).
fn parse_identify_controller(data: &[u8]) -> ControllerIdentity {
    let nn = u32::from_le_bytes([data[516], data[517], data[518], data[519]]);
    ControllerIdentity {
        serial: parse_nvme_string(&data[4..24]),
        model: parse_nvme_string(&data[24..64]),
        firmware: parse_nvme_string(&data[64..72]),
        namespace_count: nn,
        mdts: data[77],
    }
}

/// Parse an Identify Namespace page (CNS=0); None for inactive namespaces.
fn parse_identify_namespace(nsid: u32, data: &[u8]) -> Option<NvmeNamespace> {
    let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
    if nsze == 0 {
        return None;
    }
    let flbas = data[26] as usize;
    let lbaf_index = flbas & 0xF;
    // LBA format descriptors start at 128, 4 bytes each; LBADS is byte 2.
    let lbads = data[128 + lbaf_index * 4 + 2];
    if lbads < 9 {
        // Block sizes under 512 B are not valid for the NVM command set.
        return None;
    }
    Some(NvmeNamespace {
        nsid,
        size: nsze,
        block_size: 1u32 << lbads,
    })
}

impl NvmeController {
    fn regs(&self) -> &Registers {
        // SAFETY: mmio_virt maps BAR0 for the controller's lifetime.
        unsafe { &*(self.mmio_virt as *const Registers) }
    }

    /// Bring up a controller found on the PCI bus.
    ///
    /// # Safety
    /// Must be called once per device during kernel init; maps MMIO.
    unsafe fn new(pci_dev: &pci::PciDevice, name: String) -> Result<Self, NvmeError> {
        pci_dev.enable_device();

        let bar = match pci_dev.read_bar(0) {
            Some(Bar::Memory64 { addr, .. }) => addr,
            Some(Bar::Memory32 { addr, .. }) => addr as u64,
            _ => return Err(NvmeError::BadBar),
        };
        if bar == 0 {
            return Err(NvmeError::BadBar);
        }

        let mmio_virt = memory::paging::map_physical(
            bar,
            MMIO_WINDOW_SIZE,
            PageFlags::WRITABLE | PageFlags::NOCACHE,
        )
        .ok_or(NvmeError::Alloc)?;

        let regs = &*(mmio_virt as *const Registers);
        let cap = &regs.capability;
        let stride = cap.doorbell_stride();
        let enable_timeout = cap.timeout_ms().max(500);

        log::debug!(
            "NVMe: CAP MQES={} TO={}ms DSTRD={}B MPSMIN=2^{}",
            cap.max_queue_entries(),
            enable_timeout,
            stride,
            cap.min_page_shift()
        );

        // A controller left enabled by firmware must be disabled before the
        // admin queue addresses change.
        if regs.cc.is_enabled() {
            regs.cc.set_enable(false);
            if pit::deadline_poll(|| !regs.csts.is_ready(), 1, enable_timeout)
                == PollResult::TimedOut
            {
                log::error!("NVMe: controller did not clear RDY");
                memory::paging::unmap_physical(mmio_virt, MMIO_WINDOW_SIZE);
                return Err(NvmeError::Timeout);
            }
        }

        let admin_queue = match QueuePair::new(
            mmio_virt,
            0,
            ADMIN_QUEUE_ENTRIES,
            ADMIN_QUEUE_ENTRIES,
            stride,
        ) {
            Ok(q) => q,
            Err(e) => {
                memory::paging::unmap_physical(mmio_virt, MMIO_WINDOW_SIZE);
                return Err(e);
            }
        };

        regs.aqa.write(
            ((ADMIN_QUEUE_ENTRIES as u32 - 1) << 16) | (ADMIN_QUEUE_ENTRIES as u32 - 1),
        );
        regs.asq.write(admin_queue.sq_phys());
        regs.acq.write(admin_queue.cq_phys());

        // CC: NVM command set, 4 KiB pages, 64 B SQ entries, 16 B CQ entries.
        regs.cc.set_css(0);
        regs.cc.set_mps(0);
        regs.cc.set_iosqes(6);
        regs.cc.set_iocqes(4);
        regs.cc.set_enable(true);

        if pit::deadline_poll(|| regs.csts.is_ready(), 1, enable_timeout) == PollResult::TimedOut {
            log::error!("NVMe: controller did not set RDY");
            admin_queue.release();
            memory::paging::unmap_physical(mmio_virt, MMIO_WINDOW_SIZE);
            return Err(NvmeError::Timeout);
        }
        if regs.csts.is_fatal() {
            admin_queue.release();
            memory::paging::unmap_physical(mmio_virt, MMIO_WINDOW_SIZE);
            return Err(NvmeError::ControllerFatal);
        }

        let version = regs.version.value.read();
        log::info!(
            "NVMe: controller v{}.{}.{} ready",
            version >> 16,
            (version >> 8) & 0xFF,
            version & 0xFF
        );

        let mut controller = Self {
            mmio_phys: bar,
            mmio_virt,
            doorbell_stride: stride,
            max_transfer_bytes: MAX_BYTES_PER_COMMAND,
            admin_queue: Mutex::new(admin_queue),
            io_queue: None,
            use_admin_for_io: false,
            namespaces: Vec::new(),
            model: String::new(),
            serial: String::new(),
            firmware: String::new(),
            name,
        };

        let identity = match controller.identify_controller() {
            Ok(identity) => identity,
            Err(e) => {
                // The controller never reaches the initialized state; give
                // back everything acquired so far.
                controller.shutdown();
                return Err(e);
            }
        };
        log::info!(
            "NVMe: {} (SN {}, FW {}), {} namespace(s)",
            identity.model,
            identity.serial,
            identity.firmware,
            identity.namespace_count
        );
        if identity.mdts != 0 {
            // MDTS is a power-of-two multiplier of the minimum page size;
            // clamp the shift so a bogus value cannot overflow.
            let shift = (controller.regs().capability.min_page_shift() as u32
                + identity.mdts.min(16) as u32)
                .min(30);
            controller.max_transfer_bytes = controller.max_transfer_bytes.min(1usize << shift);
        }
        controller.model = identity.model;
        controller.serial = identity.serial;
        controller.firmware = identity.firmware;

        controller.create_io_queues();
        if let Err(e) = controller.identify_namespaces(identity.namespace_count) {
            controller.shutdown();
            return Err(e);
        }

        Ok(controller)
    }

    /// Run an identify command into a freshly allocated DMA page and hand
    /// the page to `parse`. The page is freed on every path.
    fn identify_page<R>(
        &self,
        cns: IdentifyCns,
        nsid: u32,
        parse: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, NvmeError> {
        let frame = memory::allocate_dma_frames(1).ok_or(NvmeError::Alloc)?;
        let phys = frame.as_u64();

        let cmd = Command {
            identify: IdentifyCommand {
                opcode: AdminOpcode::Identify as u8,
                nsid,
                data_ptr: DataPointer { prp1: phys, prp2: 0 },
                cns: cns as u8,
                ..Default::default()
            },
        };

        let result = self.admin_queue.lock().submit(cmd, IDENTIFY_TIMEOUT_MS);
        let parsed = result.map(|_| {
            // SAFETY: the controller has finished writing the page (the
            // completion is our barrier) and the frame is HHDM-mapped.
            let data = unsafe {
                core::slice::from_raw_parts(
                    memory::phys_to_virt(phys) as *const u8,
                    NVME_PAGE_SIZE,
                )
            };
            parse(data)
        });

        memory::free_frames(frame, 1);
        parsed
    }

    fn identify_controller(&self) -> Result<ControllerIdentity, NvmeError> {
        self.identify_page(IdentifyCns::Controller, 0, parse_identify_controller)
    }

    fn identify_namespaces(&mut self, namespace_count: u32) -> Result<(), NvmeError> {
        if namespace_count == 0 {
            return Err(NvmeError::InvalidNamespace);
        }
        for nsid in 1..=namespace_count.min(MAX_NAMESPACES) {
            match self.identify_page(IdentifyCns::Namespace, nsid, move |data| {
                parse_identify_namespace(nsid, data)
            }) {
                Ok(Some(ns)) => {
                    log::info!(
                        "NVMe: namespace {} - {} blocks @ {} bytes",
                        ns.nsid,
                        ns.size,
                        ns.block_size
                    );
                    self.namespaces.push(ns);
                }
                Ok(None) => {}
                Err(e) => log::warn!("NVMe: identify namespace {} failed: {}", nsid, e),
            }
        }
        Ok(())
    }

    /// Create the dedicated I/O queue pair (CQ first, then SQ). On failure
    /// the driver falls back to running data commands on the admin queue.
    fn create_io_queues(&mut self) {
        let pair = match QueuePair::new(
            self.mmio_virt,
            IO_QUEUE_ID,
            IO_QUEUE_ENTRIES,
            IO_QUEUE_ENTRIES,
            self.doorbell_stride,
        ) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("NVMe: I/O queue allocation failed ({}), using admin queue", e);
                self.use_admin_for_io = true;
                return;
            }
        };

        let create_cq = Command {
            create_cq: CreateCqCommand {
                opcode: AdminOpcode::CreateCq as u8,
                prp1: pair.cq_phys(),
                cdw10: ((IO_QUEUE_ENTRIES as u32 - 1) << 16) | IO_QUEUE_ID as u32,
                cdw11: QueueFlags::PHYS_CONTIG.bits() as u32,
                ..Default::default()
            },
        };
        if self
            .admin_queue
            .lock()
            .submit(create_cq, IDENTIFY_TIMEOUT_MS)
            .is_err()
        {
            log::warn!("NVMe: Create I/O CQ refused, using admin queue for I/O");
            pair.release();
            self.use_admin_for_io = true;
            return;
        }

        let create_sq = Command {
            create_sq: CreateSqCommand {
                opcode: AdminOpcode::CreateSq as u8,
                prp1: pair.sq_phys(),
                cdw10: ((IO_QUEUE_ENTRIES as u32 - 1) << 16) | IO_QUEUE_ID as u32,
                cdw11: ((IO_QUEUE_ID as u32) << 16) | QueueFlags::PHYS_CONTIG.bits() as u32,
                ..Default::default()
            },
        };
        if self
            .admin_queue
            .lock()
            .submit(create_sq, IDENTIFY_TIMEOUT_MS)
            .is_err()
        {
            log::warn!("NVMe: Create I/O SQ refused, using admin queue for I/O");
            pair.release();
            self.use_admin_for_io = true;
            return;
        }

        log::debug!("NVMe: I/O queue pair {} created", IO_QUEUE_ID);
        self.io_queue = Some(Mutex::new(pair));
    }

    fn submit_io(&self, cmd: Command) -> Result<CompletionEntry, NvmeError> {
        match (&self.io_queue, self.use_admin_for_io) {
            (Some(queue), false) => queue.lock().submit(cmd, IO_TIMEOUT_MS),
            _ => self.admin_queue.lock().submit(cmd, IO_TIMEOUT_MS),
        }
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    pub fn get_namespace(&self, nsid: u32) -> Option<&NvmeNamespace> {
        self.namespaces.iter().find(|ns| ns.nsid == nsid)
    }

    pub fn namespaces(&self) -> &[NvmeNamespace] {
        &self.namespaces
    }

    fn check_range(&self, nsid: u32, lba: u64, buffer_len: usize) -> Result<(u32, u64), NvmeError> {
        let ns = self.get_namespace(nsid).ok_or(NvmeError::InvalidNamespace)?;
        let block_size = ns.block_size as usize;
        if buffer_len == 0 || buffer_len % block_size != 0 {
            return Err(NvmeError::BadBuffer);
        }
        let sectors = (buffer_len / block_size) as u64;
        if lba.checked_add(sectors).map_or(true, |end| end > ns.size) {
            return Err(NvmeError::InvalidLba);
        }
        Ok((ns.block_size, sectors))
    }

    /// A DMA bounce buffer sized for one command. `prp2` is only used when
    /// the transfer spills into a second page.
    fn dma_buffer(&self, bytes: usize) -> Result<(crate::memory::PhysFrame, usize, u64, u64), NvmeError> {
        let pages = bytes.div_ceil(NVME_PAGE_SIZE);
        let frames = memory::allocate_dma_frames(pages).ok_or(NvmeError::Alloc)?;
        let phys = frames.as_u64();
        let prp2 = if pages > 1 { phys + PAGE_SIZE } else { 0 };
        Ok((frames, pages, phys, prp2))
    }

    fn rw_command(
        opcode: NvmOpcode,
        nsid: u32,
        lba: u64,
        sectors: u32,
        prp1: u64,
        prp2: u64,
    ) -> Command {
        let (cdw10, cdw11) = lba_to_cdw(lba);
        Command {
            nvm: NvmCommand {
                opcode: opcode as u8,
                nsid,
                prp1,
                prp2,
                cdw10,
                cdw11,
                cdw12: sectors - 1,
                ..Default::default()
            },
        }
    }

    fn chunk_bytes(&self, block_size: u32) -> usize {
        self.max_transfer_bytes
            .min(MAX_BYTES_PER_COMMAND)
            .max(block_size as usize)
    }

    /// Read whole blocks from a namespace into `buffer`.
    pub fn read(&self, nsid: u32, lba: u64, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let (block_size, _) = self.check_range(nsid, lba, buffer.len())?;
        let chunk_bytes = self.chunk_bytes(block_size);

        let mut current_lba = lba;
        for chunk in buffer.chunks_mut(chunk_bytes) {
            let (frames, pages, phys, prp2) = self.dma_buffer(chunk.len())?;
            let sectors = (chunk.len() / block_size as usize) as u32;

            let result = self.submit_io(Self::rw_command(
                NvmOpcode::Read,
                nsid,
                current_lba,
                sectors,
                phys,
                prp2,
            ));
            if result.is_ok() {
                // SAFETY: completion of the read orders the device's DMA
                // writes before this copy; the buffer spans chunk.len().
                unsafe {
                    ptr::copy_nonoverlapping(
                        memory::phys_to_virt(phys) as *const u8,
                        chunk.as_mut_ptr(),
                        chunk.len(),
                    );
                }
            }
            memory::free_frames(frames, pages);
            result?;
            current_lba += sectors as u64;
        }
        Ok(())
    }

    /// Write whole blocks from `buffer` to a namespace.
    pub fn write(&self, nsid: u32, lba: u64, buffer: &[u8]) -> Result<(), NvmeError> {
        let (block_size, _) = self.check_range(nsid, lba, buffer.len())?;
        let chunk_bytes = self.chunk_bytes(block_size);

        let mut current_lba = lba;
        for chunk in buffer.chunks(chunk_bytes) {
            let (frames, pages, phys, prp2) = self.dma_buffer(chunk.len())?;
            let sectors = (chunk.len() / block_size as usize) as u32;

            // SAFETY: the bounce buffer spans pages * 4 KiB >= chunk.len().
            unsafe {
                ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    memory::phys_to_virt(phys) as *mut u8,
                    chunk.len(),
                );
            }
            let result = self.submit_io(Self::rw_command(
                NvmOpcode::Write,
                nsid,
                current_lba,
                sectors,
                phys,
                prp2,
            ));
            memory::free_frames(frames, pages);
            result?;
            current_lba += sectors as u64;
        }
        Ok(())
    }

    /// Flush the namespace's volatile write cache.
    pub fn flush(&self, nsid: u32) -> Result<(), NvmeError> {
        self.get_namespace(nsid).ok_or(NvmeError::InvalidNamespace)?;
        let cmd = Command {
            nvm: NvmCommand {
                opcode: NvmOpcode::Flush as u8,
                nsid,
                ..Default::default()
            },
        };
        self.submit_io(cmd).map(|_| ())
    }

    /// One-line description for the block-device info surface.
    pub fn describe(&self) -> String {
        format!(
            "{}: {} (SN {}, FW {})",
            self.name, self.model, self.serial, self.firmware
        )
    }

    /// Shutdown-notify the controller and release every owned resource.
    pub fn shutdown(mut self) {
        {
            let regs = self.regs();
            regs.cc.set_shutdown_normal();
            if pit::deadline_poll(|| regs.csts.shutdown_complete(), 1, 1000)
                == PollResult::TimedOut
            {
                log::warn!("NVMe: {} did not acknowledge shutdown", self.name);
            }
            regs.cc.set_enable(false);
        }

        if let Some(queue) = self.io_queue.take() {
            queue.into_inner().release();
        }
        self.admin_queue.into_inner().release();
        memory::paging::unmap_physical(self.mmio_virt, MMIO_WINDOW_SIZE);
        log::info!("NVMe: {} shut down (BAR0 {:#x} released)", self.name, self.mmio_phys);
    }
}

static NVME_CONTROLLERS: Mutex<Vec<Arc<NvmeController>>> = Mutex::new(Vec::new());

/// Scan PCI for NVMe controllers (class 0x01, subclass 0x08) and bring each
/// one up.
pub fn init() {
    log::info!("[NVMe] Scanning for NVMe controllers...");

    let candidates = pci::probe_all(ProbeCriteria {
        class_code: Some(pci::class::MASS_STORAGE),
        subclass: Some(pci::storage_subclass::NVM),
        ..ProbeCriteria::any()
    });

    for (i, pci_dev) in candidates.into_iter().enumerate() {
        log::info!(
            "NVMe: found controller at {:?} (VEN:{:04x} DEV:{:04x})",
            pci_dev.address,
            pci_dev.vendor_id,
            pci_dev.device_id
        );

        let name = format!("nvme{}", i);
        match unsafe { NvmeController::new(&pci_dev, name) } {
            Ok(controller) => {
                NVME_CONTROLLERS.lock().push(Arc::new(controller));
            }
            Err(e) => {
                log::warn!("NVMe: failed to initialize controller: {}", e);
            }
        }
    }

    log::info!("[NVMe] {} controller(s) ready", NVME_CONTROLLERS.lock().len());
}

pub fn controller_count() -> usize {
    NVME_CONTROLLERS.lock().len()
}

pub fn get_controller(index: usize) -> Option<Arc<NvmeController>> {
    NVME_CONTROLLERS.lock().get(index).cloned()
}

pub fn get_first_controller() -> Option<Arc<NvmeController>> {
    NVME_CONTROLLERS.lock().first().cloned()
}

pub fn list_controllers() -> Vec<String> {
    NVME_CONTROLLERS
        .lock()
        .iter()
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvme_string_trims_padding() {
        assert_eq!(parse_nvme_string(b"QEMU NVMe Ctrl    "), "QEMU NVMe Ctrl");
        assert_eq!(parse_nvme_string(b"   "), "");
        // Non-printable bytes are replaced before trimming.
        assert_eq!(parse_nvme_string(b"disk\x00\x00\x00\x00"), "disk");
    }

    #[test]
    fn test_parse_identify_controller_fields() {
        let mut page = alloc::vec![0u8; 4096];
        page[4..24].copy_from_slice(b"SN12345             ");
        page[24..64].copy_from_slice(b"QEMU NVMe Ctrl                          ");
        page[64..72].copy_from_slice(b"1.0     ");
        page[77] = 5;
        page[516..520].copy_from_slice(&3u32.to_le_bytes());

        let id = parse_identify_controller(&page);
        assert_eq!(id.serial, "SN12345");
        assert_eq!(id.model, "QEMU NVMe Ctrl");
        assert_eq!(id.firmware, "1.0");
        assert_eq!(id.namespace_count, 3);
        assert_eq!(id.mdts, 5);
    }

    #[test]
    fn test_parse_identify_namespace_geometry() {
        let mut page = alloc::vec![0u8; 4096];
        // 2048 blocks, FLBAS selects format 0 with LBADS=9 (512 B).
        page[0..8].copy_from_slice(&2048u64.to_le_bytes());
        page[26] = 0;
        page[128 + 2] = 9;

        let ns = parse_identify_namespace(1, &page).unwrap();
        assert_eq!(ns.nsid, 1);
        assert_eq!(ns.size, 2048);
        assert_eq!(ns.block_size, 512);
    }

    #[test]
    fn test_parse_identify_namespace_inactive() {
        let page = alloc::vec![0u8; 4096];
        assert!(parse_identify_namespace(1, &page).is_none());
    }

    #[test]
    fn test_parse_identify_namespace_4k_format() {
        let mut page = alloc::vec![0u8; 4096];
        page[0..8].copy_from_slice(&512u64.to_le_bytes());
        page[26] = 1; // format index 1
        page[128 + 4 + 2] = 12; // LBADS=12 → 4096 B
        let ns = parse_identify_namespace(2, &page).unwrap();
        assert_eq!(ns.block_size, 4096);
    }
}
