//! PCI Configuration Space Access
//!
//! Provides addressing, register layout and raw access to PCI configuration
//! space. Two access mechanisms are implemented:
//!
//! - Legacy mechanism #1 via I/O ports 0xCF8/0xCFC (x86_64 only)
//! - ECAM memory-mapped configuration space
//!
//! The bus manager talks to hardware exclusively through the [`ConfigAccess`]
//! trait so that tests can substitute an in-memory configuration space.

use crate::pci::{PciError, PciResult};
use core::fmt;

/// PCI configuration address port
#[cfg(target_arch = "x86_64")]
pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
#[cfg(target_arch = "x86_64")]
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// PCI configuration registers
pub mod config {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const STATUS: u16 = 0x06;
    pub const REVISION_ID: u16 = 0x08;
    pub const PROG_IF: u16 = 0x09;
    pub const SUBCLASS: u16 = 0x0A;
    pub const CLASS_CODE: u16 = 0x0B;
    pub const CACHE_LINE_SIZE: u16 = 0x0C;
    pub const LATENCY_TIMER: u16 = 0x0D;
    pub const HEADER_TYPE: u16 = 0x0E;
    pub const BIST: u16 = 0x0F;
    pub const BASE_ADDRESSES: u16 = 0x10;
    /// Type-1 bus number block: primary, secondary, subordinate, latency
    pub const BUS_NUMBERS: u16 = 0x18;
    pub const CAPABILITIES_PTR: u16 = 0x34;
    pub const INTERRUPT_LINE: u16 = 0x3C;
    pub const INTERRUPT_PIN: u16 = 0x3D;
}

/// Header type byte encodings
pub mod header_type {
    /// Mask selecting the layout bits of the header type byte
    pub const MASK: u8 = 0x7F;
    /// Multifunction flag in bit 7
    pub const MULTIFUNCTION: u8 = 0x80;
    /// Type 0: general device
    pub const DEVICE: u8 = 0x00;
    /// Type 1: PCI-to-PCI bridge
    pub const BRIDGE: u8 = 0x01;
}

/// Class/subclass codes the bus manager cares about
pub mod class {
    pub const BRIDGE: u8 = 0x06;
    pub const SUBCLASS_PCI_TO_PCI: u8 = 0x04;
}

/// PCI capability IDs
pub mod capability {
    pub const MSI: u8 = 0x05;
    pub const VENDOR_SPECIFIC: u8 = 0x09;
    pub const MSIX: u8 = 0x11;
}

bitflags::bitflags! {
    /// Command register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        /// Respond to I/O space accesses
        const IO_SPACE = 0x0001;
        /// Respond to memory space accesses
        const MEMORY_SPACE = 0x0002;
        /// Allow the device to master the bus
        const BUS_MASTER = 0x0004;
        /// Disable legacy INTx assertion
        const INTERRUPT_DISABLE = 0x0400;
    }
}

bitflags::bitflags! {
    /// Status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciStatus: u16 {
        /// INTx interrupt is pending
        const INTERRUPT_STATUS = 0x0008;
        /// Capability list present at offset 0x34
        const CAPABILITIES_LIST = 0x0010;
    }
}

/// PCI function location: one function of one device on one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PciLocation {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciLocation {
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self { segment, bus, device, function }
    }

    /// Location of the same device's function 0
    pub const fn function0(self) -> Self {
        Self { segment: self.segment, bus: self.bus, device: self.device, function: 0 }
    }
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// Raw access to PCI configuration space
///
/// Offsets must be naturally aligned to the access width. Implementations
/// report absent functions either by returning `PciError::NotFound` or by
/// floating all-ones data; the bus manager handles both.
pub trait ConfigAccess {
    fn read8(&self, loc: PciLocation, offset: u16) -> PciResult<u8>;
    fn read16(&self, loc: PciLocation, offset: u16) -> PciResult<u16>;
    fn read32(&self, loc: PciLocation, offset: u16) -> PciResult<u32>;
    fn write8(&self, loc: PciLocation, offset: u16, value: u8) -> PciResult<()>;
    fn write16(&self, loc: PciLocation, offset: u16, value: u16) -> PciResult<()>;
    fn write32(&self, loc: PciLocation, offset: u16, value: u32) -> PciResult<()>;

    /// Bulk-read the first 256 bytes of the function's configuration space
    fn read_config(&self, loc: PciLocation, out: &mut PciConfig) -> PciResult<()> {
        for i in 0..(PCI_CONFIG_LEN / 4) {
            let value = self.read32(loc, (i * 4) as u16)?;
            out.bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }
}

/// Size of a function's legacy configuration space
pub const PCI_CONFIG_LEN: usize = 256;

/// Cached mirror of a function's configuration space
///
/// All field accessors decode little-endian out of the raw byte buffer, so
/// the cache is byte-order safe on any host.
#[derive(Clone, Debug)]
pub struct PciConfig {
    bytes: [u8; PCI_CONFIG_LEN],
}

impl PciConfig {
    pub const fn new() -> Self {
        Self { bytes: [0; PCI_CONFIG_LEN] }
    }

    fn read_u8(&self, offset: u16) -> u8 {
        self.bytes[offset as usize]
    }

    fn read_u16(&self, offset: u16) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes([self.bytes[o], self.bytes[o + 1]])
    }

    fn read_u32(&self, offset: u16) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([
            self.bytes[o],
            self.bytes[o + 1],
            self.bytes[o + 2],
            self.bytes[o + 3],
        ])
    }

    pub fn vendor_id(&self) -> u16 {
        self.read_u16(config::VENDOR_ID)
    }

    pub fn device_id(&self) -> u16 {
        self.read_u16(config::DEVICE_ID)
    }

    pub fn command(&self) -> PciCommand {
        PciCommand::from_bits_truncate(self.read_u16(config::COMMAND))
    }

    pub fn status(&self) -> PciStatus {
        PciStatus::from_bits_truncate(self.read_u16(config::STATUS))
    }

    pub fn revision_id(&self) -> u8 {
        self.read_u8(config::REVISION_ID)
    }

    pub fn prog_if(&self) -> u8 {
        self.read_u8(config::PROG_IF)
    }

    pub fn subclass(&self) -> u8 {
        self.read_u8(config::SUBCLASS)
    }

    pub fn class_code(&self) -> u8 {
        self.read_u8(config::CLASS_CODE)
    }

    pub fn latency_timer(&self) -> u8 {
        self.read_u8(config::LATENCY_TIMER)
    }

    /// Raw header type byte, including the multifunction bit
    pub fn header_type_raw(&self) -> u8 {
        self.read_u8(config::HEADER_TYPE)
    }

    /// Header layout with the multifunction bit masked off
    pub fn header_type(&self) -> u8 {
        self.header_type_raw() & header_type::MASK
    }

    pub fn is_multifunction(&self) -> bool {
        self.header_type_raw() & header_type::MULTIFUNCTION != 0
    }

    /// Raw value of base address register `index` (0..6)
    pub fn bar(&self, index: usize) -> u32 {
        debug_assert!(index < 6);
        self.read_u32(config::BASE_ADDRESSES + (index as u16) * 4)
    }

    pub fn capabilities_ptr(&self) -> u8 {
        self.read_u8(config::CAPABILITIES_PTR)
    }

    pub fn interrupt_line(&self) -> u8 {
        self.read_u8(config::INTERRUPT_LINE)
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.read_u8(config::INTERRUPT_PIN)
    }

    // Type-1 (bridge) header fields

    pub fn primary_bus(&self) -> u8 {
        self.read_u8(config::BUS_NUMBERS)
    }

    pub fn secondary_bus(&self) -> u8 {
        self.read_u8(config::BUS_NUMBERS + 1)
    }

    pub fn subordinate_bus(&self) -> u8 {
        self.read_u8(config::BUS_NUMBERS + 2)
    }

    pub fn io_base(&self) -> u8 {
        self.read_u8(0x1C)
    }

    pub fn io_limit(&self) -> u8 {
        self.read_u8(0x1D)
    }

    pub fn memory_base(&self) -> u16 {
        self.read_u16(0x20)
    }

    pub fn memory_limit(&self) -> u16 {
        self.read_u16(0x22)
    }

    pub fn prefetchable_memory_base(&self) -> u16 {
        self.read_u16(0x24)
    }

    pub fn prefetchable_memory_limit(&self) -> u16 {
        self.read_u16(0x26)
    }

    pub fn prefetchable_base_upper(&self) -> u32 {
        self.read_u32(0x28)
    }

    pub fn prefetchable_limit_upper(&self) -> u32 {
        self.read_u32(0x2C)
    }
}

impl Default for PciConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration access via the legacy 0xCF8/0xCFC port pair
///
/// Only segment 0 is reachable through this mechanism.
#[cfg(target_arch = "x86_64")]
pub struct PortIoConfigAccess;

#[cfg(target_arch = "x86_64")]
impl PortIoConfigAccess {
    pub const fn new() -> Self {
        Self
    }

    /// Generate configuration space address for the port interface
    fn config_address(loc: PciLocation, offset: u16) -> u32 {
        0x8000_0000
            | ((loc.bus as u32) << 16)
            | ((loc.device as u32) << 11)
            | ((loc.function as u32) << 8)
            | ((offset as u32) & 0xFC)
    }

    fn check(loc: PciLocation, offset: u16) -> PciResult<()> {
        if loc.segment != 0 || offset as usize >= PCI_CONFIG_LEN {
            return Err(PciError::InvalidArgs);
        }
        Ok(())
    }

    fn port_read(loc: PciLocation, offset: u16) -> u32 {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut addr_port: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
            let mut data_port: Port<u32> = Port::new(PCI_CONFIG_DATA);
            addr_port.write(Self::config_address(loc, offset));
            data_port.read()
        }
    }

    fn port_write(loc: PciLocation, offset: u16, value: u32) {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut addr_port: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
            let mut data_port: Port<u32> = Port::new(PCI_CONFIG_DATA);
            addr_port.write(Self::config_address(loc, offset));
            data_port.write(value);
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigAccess for PortIoConfigAccess {
    fn read8(&self, loc: PciLocation, offset: u16) -> PciResult<u8> {
        Self::check(loc, offset)?;
        let value = Self::port_read(loc, offset & !3);
        Ok((value >> ((offset & 3) * 8)) as u8)
    }

    fn read16(&self, loc: PciLocation, offset: u16) -> PciResult<u16> {
        Self::check(loc, offset)?;
        let value = Self::port_read(loc, offset & !3);
        Ok((value >> ((offset & 2) * 8)) as u16)
    }

    fn read32(&self, loc: PciLocation, offset: u16) -> PciResult<u32> {
        Self::check(loc, offset)?;
        Ok(Self::port_read(loc, offset & !3))
    }

    fn write8(&self, loc: PciLocation, offset: u16, value: u8) -> PciResult<()> {
        Self::check(loc, offset)?;
        let old = Self::port_read(loc, offset & !3);
        let shift = (offset & 3) * 8;
        let new = (old & !(0xFF << shift)) | ((value as u32) << shift);
        Self::port_write(loc, offset & !3, new);
        Ok(())
    }

    fn write16(&self, loc: PciLocation, offset: u16, value: u16) -> PciResult<()> {
        Self::check(loc, offset)?;
        let old = Self::port_read(loc, offset & !3);
        let shift = (offset & 2) * 8;
        let new = (old & !(0xFFFF << shift)) | ((value as u32) << shift);
        Self::port_write(loc, offset & !3, new);
        Ok(())
    }

    fn write32(&self, loc: PciLocation, offset: u16, value: u32) -> PciResult<()> {
        Self::check(loc, offset)?;
        Self::port_write(loc, offset & !3, value);
        Ok(())
    }
}

/// Configuration access via memory-mapped ECAM space
///
/// The window covers buses `start_bus..=end_bus` of a single segment and
/// must already be mapped at `base`.
pub struct EcamConfigAccess {
    base: *mut u8,
    segment: u16,
    start_bus: u8,
    end_bus: u8,
}

// The ECAM window is plain MMIO; accesses carry no thread affinity.
unsafe impl Send for EcamConfigAccess {}
unsafe impl Sync for EcamConfigAccess {}

impl EcamConfigAccess {
    /// # Safety
    ///
    /// `base` must point at a mapped ECAM window large enough to cover the
    /// given bus range, and must remain mapped for the accessor's lifetime.
    pub const unsafe fn new(base: *mut u8, segment: u16, start_bus: u8, end_bus: u8) -> Self {
        Self { base, segment, start_bus, end_bus }
    }

    /// Byte offset of `(loc, offset)` from the start of the ECAM window
    fn ecam_offset(&self, loc: PciLocation, offset: u16) -> PciResult<usize> {
        if loc.segment != self.segment
            || loc.bus < self.start_bus
            || loc.bus > self.end_bus
            || offset as usize >= PCI_CONFIG_LEN
        {
            return Err(PciError::InvalidArgs);
        }
        let bus = (loc.bus - self.start_bus) as usize;
        Ok((bus << 20)
            | ((loc.device as usize) << 15)
            | ((loc.function as usize) << 12)
            | offset as usize)
    }
}

impl ConfigAccess for EcamConfigAccess {
    fn read8(&self, loc: PciLocation, offset: u16) -> PciResult<u8> {
        let off = self.ecam_offset(loc, offset)?;
        Ok(unsafe { core::ptr::read_volatile(self.base.add(off)) })
    }

    fn read16(&self, loc: PciLocation, offset: u16) -> PciResult<u16> {
        let off = self.ecam_offset(loc, offset & !1)?;
        Ok(unsafe { core::ptr::read_volatile(self.base.add(off) as *const u16) })
    }

    fn read32(&self, loc: PciLocation, offset: u16) -> PciResult<u32> {
        let off = self.ecam_offset(loc, offset & !3)?;
        Ok(unsafe { core::ptr::read_volatile(self.base.add(off) as *const u32) })
    }

    fn write8(&self, loc: PciLocation, offset: u16, value: u8) -> PciResult<()> {
        let off = self.ecam_offset(loc, offset)?;
        unsafe { core::ptr::write_volatile(self.base.add(off), value) };
        Ok(())
    }

    fn write16(&self, loc: PciLocation, offset: u16, value: u16) -> PciResult<()> {
        let off = self.ecam_offset(loc, offset & !1)?;
        unsafe { core::ptr::write_volatile(self.base.add(off) as *mut u16, value) };
        Ok(())
    }

    fn write32(&self, loc: PciLocation, offset: u16, value: u32) -> PciResult<()> {
        let off = self.ecam_offset(loc, offset & !3)?;
        unsafe { core::ptr::write_volatile(self.base.add(off) as *mut u32, value) };
        Ok(())
    }
}
