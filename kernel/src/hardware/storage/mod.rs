//! Block storage subsystem.
//!
//! The NVMe and AHCI drivers register their devices here as tagged
//! `StorageDevice` variants behind a common `BlockDevice` interface; upper
//! layers (filesystem browser, ELF loader) consume only this interface.

pub mod ahci;
pub mod nvme;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Errors surfaced to block-device consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("no such device")]
    NoDevice,
    #[error("no such namespace")]
    NoNamespace,
    #[error("sector out of range")]
    InvalidSector,
    #[error("buffer is not a whole number of sectors")]
    BadBuffer,
    #[error("device I/O failed")]
    IoError,
}

impl From<nvme::NvmeError> for BlockError {
    fn from(e: nvme::NvmeError) -> Self {
        match e {
            nvme::NvmeError::InvalidNamespace => BlockError::NoNamespace,
            nvme::NvmeError::InvalidLba => BlockError::InvalidSector,
            nvme::NvmeError::BadBuffer => BlockError::BadBuffer,
            _ => BlockError::IoError,
        }
    }
}

impl From<ahci::AhciError> for BlockError {
    fn from(e: ahci::AhciError) -> Self {
        match e {
            ahci::AhciError::InvalidSector => BlockError::InvalidSector,
            ahci::AhciError::BadBuffer => BlockError::BadBuffer,
            ahci::AhciError::NoPort => BlockError::NoDevice,
            _ => BlockError::IoError,
        }
    }
}

/// The interface upper layers program against. `namespace` is meaningful
/// for NVMe devices only; SATA devices ignore it.
pub trait BlockDevice {
    fn read(&self, namespace: Option<u32>, lba: u64, buffer: &mut [u8])
        -> Result<(), BlockError>;
    fn write(&self, namespace: Option<u32>, lba: u64, buffer: &[u8]) -> Result<(), BlockError>;
    fn flush(&self, namespace: Option<u32>) -> Result<(), BlockError>;
    /// Human-readable device description (model/serial/firmware).
    fn info(&self) -> String;
    /// `(sector count, sector size)` of the default namespace/port.
    fn geometry(&self) -> Option<(u64, u32)>;
}

/// A storage device: NVMe namespace-addressed controller or one AHCI port.
pub enum StorageDevice {
    Nvme(Arc<nvme::NvmeController>),
    Sata {
        controller: Arc<ahci::AhciController>,
        port: usize,
    },
}

impl StorageDevice {
    fn nvme_nsid(controller: &nvme::NvmeController, namespace: Option<u32>) -> u32 {
        namespace.unwrap_or_else(|| {
            controller
                .namespaces()
                .first()
                .map(|ns| ns.nsid)
                .unwrap_or(1)
        })
    }
}

impl BlockDevice for StorageDevice {
    fn read(
        &self,
        namespace: Option<u32>,
        lba: u64,
        buffer: &mut [u8],
    ) -> Result<(), BlockError> {
        match self {
            StorageDevice::Nvme(controller) => {
                let nsid = Self::nvme_nsid(controller, namespace);
                controller.read(nsid, lba, buffer).map_err(Into::into)
            }
            StorageDevice::Sata { controller, port } => {
                controller.read(*port, lba, buffer).map_err(Into::into)
            }
        }
    }

    fn write(&self, namespace: Option<u32>, lba: u64, buffer: &[u8]) -> Result<(), BlockError> {
        match self {
            StorageDevice::Nvme(controller) => {
                let nsid = Self::nvme_nsid(controller, namespace);
                controller.write(nsid, lba, buffer).map_err(Into::into)
            }
            StorageDevice::Sata { controller, port } => {
                controller.write(*port, lba, buffer).map_err(Into::into)
            }
        }
    }

    fn flush(&self, namespace: Option<u32>) -> Result<(), BlockError> {
        match self {
            StorageDevice::Nvme(controller) => {
                let nsid = Self::nvme_nsid(controller, namespace);
                controller.flush(nsid).map_err(Into::into)
            }
            StorageDevice::Sata { controller, port } => {
                controller.flush(*port).map_err(Into::into)
            }
        }
    }

    fn info(&self) -> String {
        match self {
            StorageDevice::Nvme(controller) => controller.describe(),
            StorageDevice::Sata { controller, port } => controller
                .describe(*port)
                .unwrap_or_else(|| String::from("sata: unknown port")),
        }
    }

    fn geometry(&self) -> Option<(u64, u32)> {
        match self {
            StorageDevice::Nvme(controller) => controller
                .namespaces()
                .first()
                .map(|ns| (ns.size, ns.block_size)),
            StorageDevice::Sata { controller, port } => controller.geometry(*port),
        }
    }
}

static DEVICES: Mutex<Vec<Arc<StorageDevice>>> = Mutex::new(Vec::new());

/// Probe both drivers, then build the device registry.
pub fn init() {
    nvme::init();
    ahci::init();

    let mut devices = DEVICES.lock();

    for i in 0..nvme::controller_count() {
        if let Some(controller) = nvme::get_controller(i) {
            devices.push(Arc::new(StorageDevice::Nvme(controller)));
        }
    }

    for i in 0..ahci::controller_count() {
        if let Some(controller) = ahci::get_controller(i) {
            for port in 0..controller.port_count() {
                devices.push(Arc::new(StorageDevice::Sata {
                    controller: controller.clone(),
                    port,
                }));
            }
        }
    }

    log::info!("[storage] {} block device(s) registered", devices.len());
}

/// Total registered block devices (NVMe controllers + AHCI ports).
pub fn device_count() -> usize {
    DEVICES.lock().len()
}

/// Registered AHCI ports.
pub fn port_count() -> usize {
    DEVICES
        .lock()
        .iter()
        .filter(|d| matches!(***d, StorageDevice::Sata { .. }))
        .count()
}

pub fn get_device(id: usize) -> Option<Arc<StorageDevice>> {
    DEVICES.lock().get(id).cloned()
}

/// Read sectors from device `id`.
pub fn read(
    id: usize,
    namespace: Option<u32>,
    lba: u64,
    buffer: &mut [u8],
) -> Result<(), BlockError> {
    get_device(id)
        .ok_or(BlockError::NoDevice)?
        .read(namespace, lba, buffer)
}

/// Write sectors to device `id`.
pub fn write(
    id: usize,
    namespace: Option<u32>,
    lba: u64,
    buffer: &[u8],
) -> Result<(), BlockError> {
    get_device(id)
        .ok_or(BlockError::NoDevice)?
        .write(namespace, lba, buffer)
}

/// Flush device `id`.
pub fn flush(id: usize, namespace: Option<u32>) -> Result<(), BlockError> {
    get_device(id).ok_or(BlockError::NoDevice)?.flush(namespace)
}

/// Description of device `id`.
pub fn info(id: usize) -> Option<String> {
    get_device(id).map(|d| d.info())
}

/// `(block count, block size)` of a namespace on an NVMe device.
pub fn namespace_info(id: usize, nsid: u32) -> Option<(u64, u32)> {
    match get_device(id)?.as_ref() {
        StorageDevice::Nvme(controller) => controller
            .get_namespace(nsid)
            .map(|ns| (ns.size, ns.block_size)),
        StorageDevice::Sata { .. } => None,
    }
}
