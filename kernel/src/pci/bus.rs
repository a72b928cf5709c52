//! PCI Bus Records and Enumeration
//!
//! A [`Bus`] owns the devices discovered on it, in discovery order. The
//! root bus belongs to the bus manager; every other bus belongs to the
//! bridge that forwards to it. Probing walks all 32 device slots and up
//! to 8 functions each, honoring the multifunction bit, and recurses
//! through bridges. Resource assignment batches the bus's BAR requests
//! into one I/O and one combined MMIO list, each served largest-first.

use super::bridge::Bridge;
use super::device::{BarAllocRequest, Device};
use super::resource::{PciResourceKind, ResourceAllocator};
use super::PciResult;
use crate::hal::pci::{config, header_type, ConfigAccess, PciLocation};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Mutable state threaded through one enumeration pass
pub(crate) struct ProbeContext<'a> {
    pub config: &'a dyn ConfigAccess,
    /// Highest bus number seen or assigned so far
    pub last_bus: u8,
    /// Every bus in discovery order; pointers into bridge-owned records
    pub bus_list: Vec<*mut Bus>,
}

impl<'a> ProbeContext<'a> {
    pub fn new(config: &'a dyn ConfigAccess) -> Self {
        Self { config, last_bus: 0, bus_list: Vec::new() }
    }

    /// Raise the high-water mark to a bus number found in hardware
    pub fn set_last_bus(&mut self, bus: u8) {
        log::trace!("PCI: bus {}, existing last_bus {}", bus, self.last_bus);
        if bus > self.last_bus {
            self.last_bus = bus;
        }
    }

    /// Hand out a fresh bus number for an unconfigured bridge
    pub fn allocate_next_bus(&mut self) -> u8 {
        self.last_bus += 1;
        self.last_bus
    }

    pub fn add_bus(&mut self, bus: *mut Bus) {
        self.bus_list.push(bus);
    }
}

/// A device slot on a bus: either a plain function or a bridge
pub(crate) enum BusChild {
    Device(Box<Device>),
    Bridge(Box<Bridge>),
}

impl BusChild {
    pub fn device(&self) -> &Device {
        match self {
            BusChild::Device(d) => d,
            BusChild::Bridge(b) => b.device(),
        }
    }

    pub fn device_mut(&mut self) -> &mut Device {
        match self {
            BusChild::Device(d) => d,
            BusChild::Bridge(b) => b.device_mut(),
        }
    }
}

/// One PCI bus and the devices on it
pub struct Bus {
    loc: PciLocation,
    /// Upstream bridge; null for the root bus
    bridge: *mut Bridge,
    children: Vec<BusChild>,
    /// Root buses draw from a single upstream pool, which changes how
    /// prefetchable requests are served
    root_bus: bool,
}

impl Bus {
    /// Scan every device slot of one bus, recursing through bridges
    ///
    /// Probe failures of individual functions are absorbed; the scan
    /// continues with the next function.
    pub(crate) fn probe(
        ctx: &mut ProbeContext<'_>,
        loc: PciLocation,
        bridge: *mut Bridge,
        root_bus: bool,
    ) -> PciResult<Box<Bus>> {
        log::trace!("PCI: bus probe {}", loc);
        let cfg = ctx.config;

        let mut bus = Box::new(Bus { loc, bridge, children: Vec::new(), root_bus });
        ctx.set_last_bus(bus.bus_num());
        let bus_ptr: *mut Bus = &mut *bus;

        for dev in 0..32u8 {
            // walk all 8 functions only after seeing the multifunction bit
            // on function 0; otherwise function 0 alone
            let mut possibly_multifunction = false;
            let mut func = 0u8;
            while func == 0 || (possibly_multifunction && func < 8) {
                let floc = PciLocation::new(loc.segment, loc.bus, dev, func);
                func += 1;

                let vendor_id = match cfg.read16(floc, config::VENDOR_ID) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if vendor_id == 0xFFFF {
                    continue;
                }

                log::trace!("PCI: something at {}", floc);

                let base_class = match cfg.read8(floc, config::CLASS_CODE) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let sub_class = match cfg.read8(floc, config::SUBCLASS) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let ht = match cfg.read8(floc, config::HEADER_TYPE) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if floc.function == 0 && ht & header_type::MULTIFUNCTION != 0 {
                    possibly_multifunction = true;
                }

                use crate::hal::pci::class;
                if base_class == class::BRIDGE && sub_class == class::SUBCLASS_PCI_TO_PCI {
                    log::trace!("PCI: found bridge at {}, recursing", floc);
                    match Bridge::probe(ctx, floc, bus_ptr) {
                        Ok(br) => bus.children.push(BusChild::Bridge(br)),
                        Err(err) => {
                            log::trace!("PCI: bridge probe of {} failed: {:?}", floc, err);
                            continue;
                        }
                    }
                } else {
                    match Device::probe(cfg, floc, bus_ptr) {
                        Ok(d) => bus.children.push(BusChild::Device(d)),
                        Err(err) => {
                            log::trace!("PCI: device probe of {} failed: {:?}", floc, err);
                            continue;
                        }
                    }
                }
            }
        }

        Ok(bus)
    }

    pub fn loc(&self) -> PciLocation {
        self.loc
    }

    pub fn bus_num(&self) -> u8 {
        self.loc.bus
    }

    pub fn is_root(&self) -> bool {
        self.root_bus
    }

    pub(crate) fn bridge_ptr(&self) -> *mut Bridge {
        self.bridge
    }

    pub(crate) fn children(&self) -> &[BusChild] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut [BusChild] {
        &mut self.children
    }

    /// Allocate address space for every BAR on this bus
    ///
    /// Requests are collected from all children, split into an I/O batch
    /// and a combined MMIO batch, and served in descending size order so
    /// large alignments pack first. A root bus folds prefetchable
    /// requests into the ordinary pools. I/O exhaustion skips the BAR;
    /// MMIO exhaustion is fatal, the system cannot bring up its devices.
    pub(crate) fn allocate_resources(
        &mut self,
        cfg: &dyn ConfigAccess,
        allocator: &mut ResourceAllocator,
    ) -> PciResult<()> {
        log::trace!("PCI: allocating resources on bus {}", self.bus_num());

        let mut requests: Vec<BarAllocRequest> = Vec::new();
        for child in self.children.iter_mut() {
            child.device_mut().bar_alloc_requests(&mut requests);
        }

        let mut io_requests: Vec<BarAllocRequest> = Vec::new();
        let mut mmio_requests: Vec<BarAllocRequest> = Vec::new();
        let mut mmio64_requests: Vec<BarAllocRequest> = Vec::new();
        for request in requests {
            match request.kind {
                PciResourceKind::Io => io_requests.push(request),
                PciResourceKind::Mmio => mmio_requests.push(request),
                PciResourceKind::Mmio64 => mmio64_requests.push(request),
            }
        }

        // largest first; stable so equal sizes keep discovery order with
        // 32-bit requests ahead of 64-bit ones
        io_requests.sort_by(|a, b| b.size.cmp(&a.size));
        mmio_requests.append(&mut mmio64_requests);
        mmio_requests.sort_by(|a, b| b.size.cmp(&a.size));

        for request in &io_requests {
            let addr = match allocator.allocate_io(request.size as u32, request.align_log2) {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!(
                        "PCI: no io space for {} bar {} (size {:#x}): {:?}",
                        unsafe { (*request.device).loc() },
                        request.bar_index,
                        request.size,
                        err
                    );
                    continue;
                }
            };
            unsafe {
                (*request.device).assign_resource(cfg, request, addr as u64)?;
            }
        }

        for request in &mmio_requests {
            let can_be_64bit = request.kind == PciResourceKind::Mmio64;
            let prefetchable = if self.root_bus { false } else { request.prefetchable };
            let addr = match allocator.allocate_mmio(
                can_be_64bit,
                prefetchable,
                request.size,
                request.align_log2,
            ) {
                Ok(addr) => addr,
                Err(_) => {
                    panic!(
                        "PCI: out of mmio space assigning bar {} of {}",
                        request.bar_index,
                        unsafe { (*request.device).loc() },
                    );
                }
            };
            unsafe {
                (*request.device).assign_resource(cfg, request, addr)?;
            }
        }

        // bridges push their aggregated windows down to their children
        for child in self.children.iter_mut() {
            if let BusChild::Bridge(bridge) = child {
                bridge.assign_child_resources();
            }
        }

        Ok(())
    }

    /// Log the bus and everything on it, indented by tree depth
    pub(crate) fn dump(&self, indent: usize) {
        log::debug!("{:indent$}bus {}", "", self.bus_num(), indent = indent);
        for child in &self.children {
            match child {
                BusChild::Device(d) => d.dump(indent + 1),
                BusChild::Bridge(b) => b.dump(indent + 1),
            }
        }
    }
}
