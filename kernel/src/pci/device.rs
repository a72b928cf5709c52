//! PCI Device Records
//!
//! One [`Device`] exists per responding function, owned by its parent bus.
//! Construction probes the function's configuration space: the 256-byte
//! header is cached, the six base address registers are classified and
//! sized with the write-ones protocol, and the capability list is walked.
//! After bring-up the record services per-device requests: decode enable,
//! legacy IRQ mapping and MSI programming.

use super::bus::Bus;
use super::resource::PciResourceKind;
use super::{PciError, PciResult, PAGE_SIZE};
use crate::hal::interrupts::PlatformInterrupts;
use crate::hal::pci::{
    capability, class, config, header_type, ConfigAccess, PciCommand, PciConfig, PciLocation,
    PciStatus,
};
use crate::rtl::wavl::WavlLinks;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Malformed capability rings are cut off after this many entries
const MAX_CAPABILITY_WALK: usize = 48;

/// One decoded base address register slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciBar {
    /// Programmed base address; 0 if unallocated
    pub addr: u64,
    /// Probed size in bytes; a power of two, 0 when the slot is absent
    pub size: u64,
    pub io: bool,
    pub prefetchable: bool,
    /// True on the lower slot of a 64-bit pair; the upper slot is invalid
    pub size_64: bool,
    pub valid: bool,
}

/// One entry of a function's capability list
#[derive(Debug, Clone, Copy)]
pub struct PciCapability {
    pub id: u8,
    pub config_offset: u16,
}

impl PciCapability {
    pub fn is_msi(&self) -> bool {
        self.id == capability::MSI
    }

    pub fn is_msix(&self) -> bool {
        self.id == capability::MSIX
    }
}

/// A request for address space for one BAR, queued per bus and served in
/// descending size order
pub(crate) struct BarAllocRequest {
    pub kind: PciResourceKind,
    pub size: u64,
    /// log2 of the required alignment
    pub align_log2: u8,
    pub prefetchable: bool,
    pub device: *mut Device,
    pub bar_index: usize,
}

/// A PCI function: location, cached config, BARs and capabilities
#[derive(Debug)]
pub struct Device {
    loc: PciLocation,
    /// Parent bus; non-owning back-reference
    parent_bus: *mut Bus,
    config: PciConfig,
    bars: [PciBar; 6],
    capabilities: Vec<PciCapability>,
    /// Index of the first MSI capability in `capabilities`
    msi_cap: Option<usize>,
    /// Index of the first MSI-X capability in `capabilities`
    msix_cap: Option<usize>,
    /// Node for the bus manager's location index
    pub(crate) index_links: WavlLinks,
}

impl Device {
    pub(crate) fn new(loc: PciLocation, parent_bus: *mut Bus) -> Self {
        Self {
            loc,
            parent_bus,
            config: PciConfig::new(),
            bars: [PciBar::default(); 6],
            capabilities: Vec::new(),
            msi_cap: None,
            msix_cap: None,
            index_links: WavlLinks::new(),
        }
    }

    /// Probe one function and build a device record for it
    ///
    /// Absent functions and unknown header types return `NotFound`; a
    /// PCI-to-PCI bridge returns `NotSupported` and must be probed through
    /// `Bridge::probe` instead.
    pub(crate) fn probe(
        cfg: &dyn ConfigAccess,
        loc: PciLocation,
        parent_bus: *mut Bus,
    ) -> PciResult<Box<Device>> {
        let vendor_id = cfg.read16(loc, config::VENDOR_ID).map_err(|_| PciError::NotFound)?;
        if vendor_id == 0xFFFF {
            return Err(PciError::NotFound);
        }

        let base_class = cfg.read8(loc, config::CLASS_CODE).map_err(|_| PciError::NotFound)?;
        let sub_class = cfg.read8(loc, config::SUBCLASS).map_err(|_| PciError::NotFound)?;
        if base_class == class::BRIDGE && sub_class == class::SUBCLASS_PCI_TO_PCI {
            log::trace!("PCI: {} is a bridge, refusing device probe", loc);
            return Err(PciError::NotSupported);
        }

        let ht = cfg.read8(loc, config::HEADER_TYPE).map_err(|_| PciError::NotFound)?
            & header_type::MASK;
        if ht != header_type::DEVICE {
            log::trace!("PCI: {} has header type {} we don't understand, skipping", loc, ht);
            return Err(PciError::NotFound);
        }

        let mut device = Box::new(Device::new(loc, parent_bus));
        device.load_config(cfg)?;
        device.load_bars(cfg)?;
        device.probe_capabilities(cfg)?;
        Ok(device)
    }

    pub fn loc(&self) -> PciLocation {
        self.loc
    }

    pub(crate) fn parent_bus(&self) -> *mut Bus {
        self.parent_bus
    }

    pub fn vendor_id(&self) -> u16 {
        self.config.vendor_id()
    }

    pub fn device_id(&self) -> u16 {
        self.config.device_id()
    }

    pub fn base_class(&self) -> u8 {
        self.config.class_code()
    }

    pub fn sub_class(&self) -> u8 {
        self.config.subclass()
    }

    pub fn prog_if(&self) -> u8 {
        self.config.prog_if()
    }

    pub fn header_type(&self) -> u8 {
        self.config.header_type()
    }

    pub fn has_msi(&self) -> bool {
        self.msi_cap.is_some()
    }

    pub fn has_msix(&self) -> bool {
        self.msix_cap.is_some()
    }

    pub(crate) fn config(&self) -> &PciConfig {
        &self.config
    }

    /// Cached state of one BAR slot
    pub fn bar(&self, index: usize) -> &PciBar {
        &self.bars[index]
    }

    /// Copy of the cached BAR array
    pub fn read_bars(&self) -> [PciBar; 6] {
        self.bars
    }

    /// Refresh the configuration cache from hardware
    pub(crate) fn load_config(&mut self, cfg: &dyn ConfigAccess) -> PciResult<()> {
        cfg.read_config(self.loc, &mut self.config)
    }

    /// Decode and size every BAR slot
    ///
    /// IO and MEM decode are disabled around the write-ones probe since
    /// the BAR addresses themselves are temporarily clobbered, and
    /// restored afterwards.
    pub(crate) fn load_bars(&mut self, cfg: &dyn ConfigAccess) -> PciResult<()> {
        let num_bars = match self.config.header_type() {
            header_type::DEVICE => 6,
            header_type::BRIDGE => 2,
            _ => return Err(PciError::NotSupported),
        };

        let command = cfg.read16(self.loc, config::COMMAND)?;
        let decode_bits = (PciCommand::IO_SPACE | PciCommand::MEMORY_SPACE).bits();
        cfg.write16(self.loc, config::COMMAND, command & !decode_bits)?;

        let mut i = 0;
        while i < num_bars {
            self.bars[i] = PciBar::default();
            let offset = config::BASE_ADDRESSES + (i as u16) * 4;
            let raw = self.config.bar(i);

            if raw & 0x1 != 0 {
                // io space
                self.bars[i].io = true;
                self.bars[i].addr = (raw & !0x3) as u64;

                cfg.write32(self.loc, offset, 0xFFFF)?;
                let readback = cfg.read32(self.loc, offset)?;
                cfg.write32(self.loc, offset, self.bars[i].addr as u32)?;

                self.bars[i].size = (((readback & !0b11) ^ 0xFFFF).wrapping_add(1)) as u64;
                self.bars[i].valid = self.bars[i].size != 0;
            } else if raw & 0b110 == 0b000 {
                // 32-bit memory
                self.bars[i].prefetchable = raw & (1 << 3) != 0;
                self.bars[i].addr = (raw & !0xF) as u64;

                cfg.write32(self.loc, offset, 0xFFFF_FFFF)?;
                let readback = cfg.read32(self.loc, offset)?;
                cfg.write32(self.loc, offset, self.bars[i].addr as u32)?;

                self.bars[i].size = ((!(readback & !0b1111)).wrapping_add(1)) as u64;
                self.bars[i].valid = self.bars[i].size != 0;
            } else if raw & 0b110 == 0b100 {
                // 64-bit memory, consuming this slot and the next
                if i + 1 >= num_bars {
                    // cannot start a 64-bit pair in the last slot
                    i += 1;
                    continue;
                }
                self.bars[i].prefetchable = raw & (1 << 3) != 0;
                self.bars[i].size_64 = true;
                self.bars[i].addr =
                    (raw & !0xF) as u64 | ((self.config.bar(i + 1) as u64) << 32);

                cfg.write32(self.loc, offset, 0xFFFF_FFFF)?;
                let lo = cfg.read32(self.loc, offset)?;
                cfg.write32(self.loc, offset + 4, 0xFFFF_FFFF)?;
                let hi = cfg.read32(self.loc, offset + 4)?;
                cfg.write32(self.loc, offset, self.bars[i].addr as u32)?;
                cfg.write32(self.loc, offset + 4, (self.bars[i].addr >> 32) as u32)?;

                let readback = (hi as u64) << 32 | lo as u64;
                self.bars[i].size = (!(readback & !0b1111u64)).wrapping_add(1);
                self.bars[i].valid = self.bars[i].size != 0;

                // the upper half of the pair is not a slot of its own
                i += 1;
                self.bars[i] = PciBar::default();
            }

            i += 1;
        }

        cfg.write16(self.loc, config::COMMAND, command)?;
        Ok(())
    }

    /// Walk the capability list out of the cached header
    pub(crate) fn probe_capabilities(&mut self, cfg: &dyn ConfigAccess) -> PciResult<()> {
        if !self.config.status().contains(PciStatus::CAPABILITIES_LIST) {
            return Ok(());
        }

        // type 0 and type 1 keep the pointer at the same offset
        let mut cap_ptr = self.config.capabilities_ptr() as u16;
        let mut walked = 0;
        while cap_ptr != 0 {
            if walked >= MAX_CAPABILITY_WALK {
                log::warn!("PCI: {} capability list does not terminate, cutting it off", self.loc);
                break;
            }
            walked += 1;

            let id = cfg.read8(self.loc, cap_ptr)?;
            log::trace!("PCI: {} capability id {:#x} at offset {:#x}", self.loc, id, cap_ptr);

            let cap = PciCapability { id, config_offset: cap_ptr };
            self.capabilities.push(cap);
            match id {
                capability::MSI => {
                    if self.msi_cap.is_none() {
                        self.msi_cap = Some(self.capabilities.len() - 1);
                    }
                }
                capability::MSIX => {
                    if self.msix_cap.is_none() {
                        self.msix_cap = Some(self.capabilities.len() - 1);
                    }
                }
                _ => {}
            }

            cap_ptr = cfg.read8(self.loc, cap_ptr + 1)? as u16;
        }

        Ok(())
    }

    /// Set IO, MEM and bus-master enable
    pub(crate) fn enable(&self, cfg: &dyn ConfigAccess) -> PciResult<()> {
        log::trace!("PCI: enabling {}", self.loc);
        let command = cfg.read16(self.loc, config::COMMAND)?;
        let bits =
            (PciCommand::IO_SPACE | PciCommand::MEMORY_SPACE | PciCommand::BUS_MASTER).bits();
        cfg.write16(self.loc, config::COMMAND, command | bits)?;
        Ok(())
    }

    /// Map the function's legacy interrupt line to a platform vector
    pub(crate) fn allocate_irq(
        &self,
        cfg: &dyn ConfigAccess,
        platform: &dyn PlatformInterrupts,
    ) -> PciResult<u32> {
        let line = cfg.read8(self.loc, config::INTERRUPT_LINE)?;
        if line == 0 {
            return Err(PciError::NoResources);
        }
        platform.legacy_irq_to_vector(line)
    }

    /// Allocate platform vectors and program the MSI capability
    ///
    /// The capability is disabled while the message is written and enabled
    /// last; the allocated base vector is cached in the interrupt-line
    /// register. Only single-vector allocation is supported.
    pub(crate) fn allocate_msi(
        &self,
        cfg: &dyn ConfigAccess,
        platform: &mut dyn PlatformInterrupts,
        count: usize,
    ) -> PciResult<u32> {
        if count != 1 {
            return Err(PciError::NotSupported);
        }
        let cap = match self.msi_cap {
            Some(index) => &self.capabilities[index],
            None => return Err(PciError::NotSupported),
        };
        debug_assert!(cap.is_msi());

        let vector_base = platform.allocate_vectors(count)?;
        let (msi_address, msi_data) = platform.msi_values(vector_base)?;

        let cap_offset = cap.config_offset;
        let control = cfg.read16(self.loc, cap_offset + 2)?;
        // disable while the message registers are rewritten
        cfg.write16(self.loc, cap_offset + 2, control & !0x1)?;
        cfg.write32(self.loc, cap_offset + 4, msi_address as u32)?;
        if control & (1 << 7) != 0 {
            // 64-bit capable layout
            cfg.write32(self.loc, cap_offset + 8, (msi_address >> 32) as u32)?;
            cfg.write16(self.loc, cap_offset + 0xC, msi_data)?;
        } else {
            cfg.write16(self.loc, cap_offset + 8, msi_data)?;
        }

        // enabled, one vector, no per-vector masking
        cfg.write16(self.loc, cap_offset + 2, 0x1)?;

        // cache the allocation where the legacy line would live
        cfg.write8(self.loc, config::INTERRUPT_LINE, vector_base as u8)?;

        Ok(vector_base)
    }

    /// Queue an allocation request for every valid BAR
    ///
    /// I/O sizes round to 16 bytes with 16-byte alignment; memory sizes
    /// round to a page with natural power-of-two alignment.
    pub(crate) fn bar_alloc_requests(&mut self, out: &mut Vec<BarAllocRequest>) {
        let self_ptr = self as *mut Device;
        for (i, bar) in self.bars.iter().enumerate() {
            if !bar.valid {
                continue;
            }

            let request = if bar.io {
                BarAllocRequest {
                    kind: PciResourceKind::Io,
                    size: round_up(bar.size, 16),
                    align_log2: 4,
                    prefetchable: false,
                    device: self_ptr,
                    bar_index: i,
                }
            } else {
                let size = round_up(bar.size, PAGE_SIZE);
                BarAllocRequest {
                    kind: if bar.size_64 { PciResourceKind::Mmio64 } else { PciResourceKind::Mmio },
                    size,
                    align_log2: size.trailing_zeros() as u8,
                    prefetchable: bar.prefetchable,
                    device: self_ptr,
                    bar_index: i,
                }
            };
            out.push(request);
        }
    }

    /// Write an allocated address into the BAR named by `request` and
    /// refresh the cached state
    ///
    /// The hardwired low bits are left alone; only the address lanes are
    /// written.
    pub(crate) fn assign_resource(
        &mut self,
        cfg: &dyn ConfigAccess,
        request: &BarAllocRequest,
        address: u64,
    ) -> PciResult<()> {
        log::trace!(
            "PCI: {} bar {} assigned {:#x} (size {:#x})",
            self.loc,
            request.bar_index,
            address,
            request.size
        );
        debug_assert!(address & ((1u64 << request.align_log2) - 1) == 0);

        let offset = config::BASE_ADDRESSES + (request.bar_index as u16) * 4;
        match request.kind {
            PciResourceKind::Io => {
                cfg.write32(self.loc, offset, (address & 0xFFFC) as u32)?;
            }
            PciResourceKind::Mmio => {
                cfg.write32(self.loc, offset, (address & 0xFFFF_FFF0) as u32)?;
            }
            PciResourceKind::Mmio64 => {
                cfg.write32(self.loc, offset, (address & 0xFFFF_FFF0) as u32)?;
                cfg.write32(self.loc, offset + 4, (address >> 32) as u32)?;
            }
        }

        self.load_config(cfg)?;
        self.load_bars(cfg)?;
        Ok(())
    }

    /// Log the device and its valid BARs, indented by tree depth
    pub(crate) fn dump(&self, indent: usize) {
        log::debug!(
            "{:indent$}dev {} vid:pid {:04x}:{:04x} base:sub:intr {}:{}:{} int {} {}{}",
            "",
            self.loc,
            self.vendor_id(),
            self.device_id(),
            self.base_class(),
            self.sub_class(),
            self.prog_if(),
            self.config.interrupt_line(),
            if self.has_msi() { "msi " } else { "" },
            if self.has_msix() { "msix " } else { "" },
            indent = indent,
        );
        for (i, bar) in self.bars.iter().enumerate() {
            if bar.valid {
                log::debug!(
                    "{:indent$}BAR {}: addr {:#x} size {:#x} io {} 64b {} pref {}",
                    "",
                    i,
                    bar.addr,
                    bar.size,
                    bar.io,
                    bar.size_64,
                    bar.prefetchable,
                    indent = indent + 1,
                );
            }
        }
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
