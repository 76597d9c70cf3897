//! PCI Configuration Space Access
//!
//! Scans the PCI bus via the legacy 0xCF8/0xCFC port pair (configuration
//! mechanism #1) and exposes the probe API the storage drivers consume:
//! criteria-based device lookup, command-register enabling, and BAR
//! address/size decoding.
//!
//! Reference: PCI Local Bus Specification 3.0

use super::io::{inl, outl};
use alloc::vec::Vec;
use core::fmt;

/// PCI Configuration Address Port
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI Configuration Data Port
const CONFIG_DATA: u16 = 0xCFC;

/// PCI class codes
pub mod class {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const BRIDGE: u8 = 0x06;
}

/// Mass-storage subclasses
pub mod storage_subclass {
    pub const IDE: u8 = 0x01;
    pub const SATA: u8 = 0x06;
    pub const NVM: u8 = 0x08;
}

/// SATA programming interfaces
pub mod sata_progif {
    pub const AHCI: u8 = 0x01;
}

/// PCI configuration register offsets
pub mod config {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const COMMAND: u8 = 0x04;
    pub const STATUS: u8 = 0x06;
    pub const REVISION_ID: u8 = 0x08;
    pub const PROG_IF: u8 = 0x09;
    pub const SUBCLASS: u8 = 0x0A;
    pub const CLASS_CODE: u8 = 0x0B;
    pub const HEADER_TYPE: u8 = 0x0E;
    pub const BAR0: u8 = 0x10;
    pub const INTERRUPT_LINE: u8 = 0x3C;
    pub const INTERRUPT_PIN: u8 = 0x3D;
}

/// PCI command register bits
pub mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTERRUPT_DISABLE: u16 = 1 << 10;
}

/// Base Address Register (BAR) types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    Io { port: u16 },
    Memory32 { addr: u32, prefetchable: bool },
    Memory64 { addr: u64, prefetchable: bool },
}

impl Bar {
    /// The address regardless of BAR type.
    pub fn address(&self) -> u64 {
        match *self {
            Bar::Io { port } => port as u64,
            Bar::Memory32 { addr, .. } => addr as u64,
            Bar::Memory64 { addr, .. } => addr,
        }
    }
}

/// A PCI device location
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Debug for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

impl PciAddress {
    /// Create a new PCI address
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Convert to configuration address format: bit 31 = enable,
    /// bits 23:16 = bus, 15:11 = device, 10:8 = function, 7:2 = register.
    fn config_address(&self, offset: u8) -> u32 {
        let bus = self.bus as u32;
        let device = (self.device as u32) & 0x1F;
        let function = (self.function as u32) & 0x07;
        let offset = (offset as u32) & 0xFC;

        0x8000_0000 | (bus << 16) | (device << 11) | (function << 8) | offset
    }
}

/// PCI device information
#[derive(Clone, Copy)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PciDevice({:?} ID {:04x}:{:04x} Class {:02x}:{:02x})",
            self.address, self.vendor_id, self.device_id, self.class_code, self.subclass
        )
    }
}

impl PciDevice {
    /// Read a configuration register (8-bit)
    pub fn read_config_u8(&self, offset: u8) -> u8 {
        let addr = self.address.config_address(offset & !0x03);
        let shift = (offset & 0x03) * 8;

        // SAFETY: PCI configuration space access via standard I/O ports
        unsafe {
            outl(CONFIG_ADDRESS, addr);
            ((inl(CONFIG_DATA) >> shift) & 0xFF) as u8
        }
    }

    /// Read a configuration register (16-bit)
    pub fn read_config_u16(&self, offset: u8) -> u16 {
        let addr = self.address.config_address(offset & !0x03);
        let shift = (offset & 0x02) * 8;

        // SAFETY: PCI configuration space access via standard I/O ports
        unsafe {
            outl(CONFIG_ADDRESS, addr);
            ((inl(CONFIG_DATA) >> shift) & 0xFFFF) as u16
        }
    }

    /// Read a configuration register (32-bit)
    pub fn read_config_u32(&self, offset: u8) -> u32 {
        let addr = self.address.config_address(offset);

        // SAFETY: PCI configuration space access via standard I/O ports
        unsafe {
            outl(CONFIG_ADDRESS, addr);
            inl(CONFIG_DATA)
        }
    }

    /// Write to a configuration register (16-bit)
    pub fn write_config_u16(&self, offset: u8, value: u16) {
        let addr = self.address.config_address(offset & !0x03);
        let shift = (offset & 0x02) * 8;

        // SAFETY: PCI configuration space access via standard I/O ports
        unsafe {
            outl(CONFIG_ADDRESS, addr);
            let old = inl(CONFIG_DATA);
            let mask = !(0xFFFFu32 << shift);
            let new = (old & mask) | ((value as u32) << shift);
            outl(CONFIG_ADDRESS, addr);
            outl(CONFIG_DATA, new);
        }
    }

    /// Write to a configuration register (32-bit)
    pub fn write_config_u32(&self, offset: u8, value: u32) {
        let addr = self.address.config_address(offset);

        // SAFETY: PCI configuration space access via standard I/O ports
        unsafe {
            outl(CONFIG_ADDRESS, addr);
            outl(CONFIG_DATA, value);
        }
    }

    /// Read a Base Address Register (BAR)
    pub fn read_bar(&self, bar_index: u8) -> Option<Bar> {
        if bar_index > 5 {
            return None;
        }

        let offset = config::BAR0 + (bar_index * 4);
        let bar_low = self.read_config_u32(offset);

        if bar_low == 0 {
            return None;
        }

        match decode_bar_low(bar_low) {
            Some(DecodedBar::Io { port }) => Some(Bar::Io { port }),
            Some(DecodedBar::Memory32 { addr, prefetchable }) => {
                Some(Bar::Memory32 { addr, prefetchable })
            }
            Some(DecodedBar::Memory64Low { low, prefetchable }) => {
                if bar_index >= 5 {
                    return None; // no high half available
                }
                let bar_high = self.read_config_u32(offset + 4);
                let addr = ((bar_high as u64) << 32) | low as u64;
                Some(Bar::Memory64 { addr, prefetchable })
            }
            None => None,
        }
    }

    /// Size a BAR via the standard write-all-ones probe, restoring the
    /// original value afterward.
    pub fn bar_size(&self, bar_index: u8) -> Option<u64> {
        if bar_index > 5 {
            return None;
        }
        let offset = config::BAR0 + (bar_index * 4);
        let original = self.read_config_u32(offset);
        if original == 0 {
            return None;
        }

        self.write_config_u32(offset, 0xFFFF_FFFF);
        let probed = self.read_config_u32(offset);
        self.write_config_u32(offset, original);

        let is_io = original & 0x1 != 0;
        let is_64bit = !is_io && (original >> 1) & 0x3 == 2;

        if is_64bit && bar_index < 5 {
            let high_offset = offset + 4;
            let original_high = self.read_config_u32(high_offset);
            self.write_config_u32(high_offset, 0xFFFF_FFFF);
            let probed_high = self.read_config_u32(high_offset);
            self.write_config_u32(high_offset, original_high);
            Some(bar_size_from_probe_64(probed, probed_high))
        } else {
            bar_size_from_probe_32(probed, is_io)
        }
    }

    /// Enable memory space, I/O space and bus mastering — everything a
    /// DMA-capable device needs before its first transfer.
    pub fn enable_device(&self) {
        let mut cmd = self.read_config_u16(config::COMMAND);
        cmd |= command::MEMORY_SPACE | command::IO_SPACE | command::BUS_MASTER;
        self.write_config_u16(config::COMMAND, cmd);
    }
}

/// Decoded low dword of a BAR (pure half of `read_bar`, unit-testable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodedBar {
    Io { port: u16 },
    Memory32 { addr: u32, prefetchable: bool },
    Memory64Low { low: u32, prefetchable: bool },
}

fn decode_bar_low(bar_low: u32) -> Option<DecodedBar> {
    if bar_low & 0x1 != 0 {
        return Some(DecodedBar::Io {
            port: (bar_low & 0xFFFF_FFFC) as u16,
        });
    }
    let bar_type = (bar_low >> 1) & 0x3;
    let prefetchable = (bar_low >> 3) & 0x1 != 0;
    match bar_type {
        0 => Some(DecodedBar::Memory32 {
            addr: bar_low & 0xFFFF_FFF0,
            prefetchable,
        }),
        2 => Some(DecodedBar::Memory64Low {
            low: bar_low & 0xFFFF_FFF0,
            prefetchable,
        }),
        _ => None,
    }
}

fn bar_size_from_probe_32(probed: u32, is_io: bool) -> Option<u64> {
    let mask = if is_io { 0xFFFF_FFFC } else { 0xFFFF_FFF0 };
    let bits = probed & mask;
    if bits == 0 {
        return None;
    }
    Some((!(bits as u64) + 1) & 0xFFFF_FFFF)
}

fn bar_size_from_probe_64(probed_low: u32, probed_high: u32) -> u64 {
    let bits = ((probed_high as u64) << 32) | (probed_low & 0xFFFF_FFF0) as u64;
    !bits + 1
}

/// Criteria for `probe_all` / `probe_first`. `None` fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeCriteria {
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    pub class_code: Option<u8>,
    pub subclass: Option<u8>,
    pub prog_if: Option<u8>,
}

impl ProbeCriteria {
    pub const fn any() -> Self {
        ProbeCriteria {
            vendor_id: None,
            device_id: None,
            class_code: None,
            subclass: None,
            prog_if: None,
        }
    }

    fn matches(&self, dev: &PciDevice) -> bool {
        self.vendor_id.map_or(true, |v| v == dev.vendor_id)
            && self.device_id.map_or(true, |v| v == dev.device_id)
            && self.class_code.map_or(true, |v| v == dev.class_code)
            && self.subclass.map_or(true, |v| v == dev.subclass)
            && self.prog_if.map_or(true, |v| v == dev.prog_if)
    }
}

/// Iterator for scanning the PCI bus
pub struct PciScanner {
    bus: u16,
    device: u8,
    function: u8,
}

impl PciScanner {
    pub fn new() -> Self {
        Self {
            bus: 0,
            device: 0,
            function: 0,
        }
    }

    fn skip_to_next_device(&mut self) {
        self.function = 0;
        self.device += 1;
        if self.device >= 32 {
            self.device = 0;
            self.bus += 1;
        }
    }
}

impl Default for PciScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for PciScanner {
    type Item = PciDevice;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.bus > 255 {
                return None;
            }

            let address = PciAddress::new(self.bus as u8, self.device, self.function);

            // Advance counters for next iteration
            let current_function = self.function;
            self.function += 1;
            if self.function >= 8 {
                self.skip_to_next_device();
            }

            let vendor_id = read_vendor_id(address);
            if vendor_id == 0xFFFF {
                // If function 0 doesn't exist, the rest of the functions
                // of this device can't either.
                if current_function == 0 {
                    self.skip_to_next_device();
                }
                continue;
            }

            let dev = probe_device(address, vendor_id);
            // Single-function device: skip functions 1-7.
            if current_function == 0 && (dev.header_type & 0x80 == 0) {
                self.skip_to_next_device();
            }
            return Some(dev);
        }
    }
}

/// Read vendor ID at a specific PCI address
fn read_vendor_id(address: PciAddress) -> u16 {
    let addr = address.config_address(config::VENDOR_ID);

    // SAFETY: PCI configuration space access via standard I/O ports
    unsafe {
        outl(CONFIG_ADDRESS, addr);
        (inl(CONFIG_DATA) & 0xFFFF) as u16
    }
}

/// Probe a specific PCI address and return device info
fn probe_device(address: PciAddress, vendor_id: u16) -> PciDevice {
    let dev = PciDevice {
        address,
        vendor_id,
        device_id: 0,
        class_code: 0,
        subclass: 0,
        prog_if: 0,
        revision: 0,
        header_type: 0,
        interrupt_line: 0,
        interrupt_pin: 0,
    };

    let device_id = dev.read_config_u16(config::DEVICE_ID);
    let class_rev_grp = dev.read_config_u32(config::REVISION_ID);
    let header_type = dev.read_config_u8(config::HEADER_TYPE);
    let int_grp = dev.read_config_u32(config::INTERRUPT_LINE);

    PciDevice {
        address,
        vendor_id,
        device_id,
        class_code: ((class_rev_grp >> 24) & 0xFF) as u8,
        subclass: ((class_rev_grp >> 16) & 0xFF) as u8,
        prog_if: ((class_rev_grp >> 8) & 0xFF) as u8,
        revision: (class_rev_grp & 0xFF) as u8,
        header_type,
        interrupt_line: (int_grp & 0xFF) as u8,
        interrupt_pin: ((int_grp >> 8) & 0xFF) as u8,
    }
}

/// All devices matching the criteria.
pub fn probe_all(criteria: ProbeCriteria) -> Vec<PciDevice> {
    PciScanner::new()
        .filter(|dev| criteria.matches(dev))
        .collect()
}

/// First device matching the criteria.
pub fn probe_first(criteria: ProbeCriteria) -> Option<PciDevice> {
    PciScanner::new().find(|dev| criteria.matches(dev))
}

/// Helper to find a device by vendor and device ID
pub fn find_device(vendor_id: u16, device_id: u16) -> Option<PciDevice> {
    probe_first(ProbeCriteria {
        vendor_id: Some(vendor_id),
        device_id: Some(device_id),
        ..ProbeCriteria::any()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_address_encoding() {
        let addr = PciAddress::new(0, 3, 0);
        assert_eq!(addr.config_address(0x10), 0x8000_1810);

        let addr = PciAddress::new(1, 31, 7);
        // bus 1 << 16 | dev 31 << 11 | fn 7 << 8, register dword-aligned
        assert_eq!(addr.config_address(0x3D), 0x8001_FF3C);
    }

    #[test]
    fn test_decode_io_bar() {
        assert_eq!(
            decode_bar_low(0xC001),
            Some(DecodedBar::Io { port: 0xC000 })
        );
    }

    #[test]
    fn test_decode_memory_bars() {
        assert_eq!(
            decode_bar_low(0xFEB0_0000),
            Some(DecodedBar::Memory32 {
                addr: 0xFEB0_0000,
                prefetchable: false
            })
        );
        assert_eq!(
            decode_bar_low(0xFEB0_000C),
            Some(DecodedBar::Memory64Low {
                low: 0xFEB0_0000,
                prefetchable: true
            })
        );
    }

    #[test]
    fn test_bar_size_from_probe() {
        // 16 KiB memory BAR: device hardwires the low 14 bits.
        assert_eq!(bar_size_from_probe_32(0xFFFF_C000, false), Some(0x4000));
        // 32-byte I/O BAR.
        assert_eq!(bar_size_from_probe_32(0xFFFF_FFE1, true), Some(0x20));
        // Unimplemented BAR probes as zero.
        assert_eq!(bar_size_from_probe_32(0, false), None);
    }

    #[test]
    fn test_probe_criteria_matching() {
        let dev = PciDevice {
            address: PciAddress::new(0, 4, 0),
            vendor_id: 0x1B36,
            device_id: 0x0010,
            class_code: 0x01,
            subclass: 0x08,
            prog_if: 0x02,
            revision: 0,
            header_type: 0,
            interrupt_line: 11,
            interrupt_pin: 1,
        };
        let nvme = ProbeCriteria {
            class_code: Some(0x01),
            subclass: Some(0x08),
            ..ProbeCriteria::any()
        };
        assert!(nvme.matches(&dev));
        let ahci = ProbeCriteria {
            class_code: Some(0x01),
            subclass: Some(0x06),
            ..ProbeCriteria::any()
        };
        assert!(!ahci.matches(&dev));
    }
}
