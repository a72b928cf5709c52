//! PCI-to-PCI Bridge Records
//!
//! A [`Bridge`] is a device of class 0x06/0x04 with a type-1 header. It
//! owns the secondary [`Bus`] on its downstream side. Probing a bridge
//! assigns bus numbers when the firmware left them blank, extends every
//! ancestor's subordinate range to cover newly discovered buses, and then
//! recursively scans the secondary bus.

use super::bus::{Bus, ProbeContext};
use super::device::Device;
use super::{PciError, PciResult};
use crate::hal::pci::{config, header_type, ConfigAccess, PciLocation};
use alloc::boxed::Box;

/// An inclusive `[base, limit]` forwarding window of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeWindow {
    pub base: u64,
    pub limit: u64,
}

/// A PCI-to-PCI bridge: a device plus its secondary bus
pub struct Bridge {
    device: Device,
    secondary_bus: Option<Box<Bus>>,
}

impl Bridge {
    fn new(loc: PciLocation, parent_bus: *mut Bus) -> Self {
        Self { device: Device::new(loc, parent_bus), secondary_bus: None }
    }

    /// Probe a bridge function and recursively scan its secondary bus
    pub(crate) fn probe(
        ctx: &mut ProbeContext<'_>,
        loc: PciLocation,
        parent_bus: *mut Bus,
    ) -> PciResult<Box<Bridge>> {
        log::trace!("PCI: bridge probe {}", loc);
        let cfg = ctx.config;

        let vendor_id = cfg.read16(loc, config::VENDOR_ID).map_err(|_| PciError::NotFound)?;
        if vendor_id == 0xFFFF {
            return Err(PciError::NotFound);
        }

        let ht = cfg.read8(loc, config::HEADER_TYPE).map_err(|_| PciError::NotFound)?
            & header_type::MASK;
        if ht != header_type::BRIDGE {
            log::trace!("PCI: {} has header type {} for a bridge, skipping", loc, ht);
            return Err(PciError::NotFound);
        }

        let mut bridge = Box::new(Bridge::new(loc, parent_bus));
        bridge.device.load_config(cfg)?;
        bridge.device.load_bars(cfg)?;
        bridge.device.probe_capabilities(cfg)?;

        log::trace!(
            "PCI: bridge {} primary {} secondary {} subordinate {}",
            loc,
            bridge.primary_bus(),
            bridge.secondary_bus_num(),
            bridge.subordinate_bus_num()
        );

        if bridge.secondary_bus_num() == 0 {
            // The firmware left the bridge unconfigured. Hand out a fresh
            // secondary bus number; the subordinate range starts out
            // covering just that bus and is back-patched by descendants.
            let new_secondary = ctx.allocate_next_bus();
            let primary = unsafe { (*parent_bus).bus_num() };
            log::trace!(
                "PCI: assigning secondary bus {} to bridge {}, parent bus {}",
                new_secondary,
                loc,
                primary
            );
            bridge.assign_bus_numbers(cfg, primary, new_secondary, new_secondary)?;

            unsafe {
                let parent_bridge = (*parent_bus).bridge_ptr();
                if !parent_bridge.is_null() {
                    (*parent_bridge).extend_subordinate_range(cfg, new_secondary)?;
                }
            }
        }

        // Overlapping bus numbers mean the firmware topology disagrees
        // with what enumeration already handed out.
        if bridge.secondary_bus_num() < ctx.last_bus {
            log::warn!(
                "PCI: bridge {} claims secondary bus {} already seen (last bus {})",
                loc,
                bridge.secondary_bus_num(),
                ctx.last_bus
            );
            return Err(PciError::NoResources);
        }

        let bus_loc = PciLocation::new(loc.segment, bridge.secondary_bus_num(), 0, 0);
        let bridge_ptr: *mut Bridge = &mut *bridge;
        let mut new_bus = Bus::probe(ctx, bus_loc, bridge_ptr, false)?;

        // the box keeps the bus at a stable address; register it before
        // handing ownership to the bridge
        let bus_ptr: *mut Bus = &mut *new_bus;
        bridge.secondary_bus = Some(new_bus);
        ctx.add_bus(bus_ptr);

        Ok(bridge)
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn loc(&self) -> PciLocation {
        self.device.loc()
    }

    pub fn primary_bus(&self) -> u8 {
        self.device.config().primary_bus()
    }

    pub fn secondary_bus_num(&self) -> u8 {
        self.device.config().secondary_bus()
    }

    pub fn subordinate_bus_num(&self) -> u8 {
        self.device.config().subordinate_bus()
    }

    /// The bus on the bridge's downstream side
    pub fn secondary_bus(&self) -> Option<&Bus> {
        self.secondary_bus.as_deref()
    }

    /// Grow the subordinate range to cover a newly discovered bus and pass
    /// the word up the ancestor chain
    pub(crate) fn extend_subordinate_range(
        &mut self,
        cfg: &dyn ConfigAccess,
        new_secondary_bus: u8,
    ) -> PciResult<()> {
        log::trace!(
            "PCI: bridge {} extend subordinate to {} (currently {}..{})",
            self.loc(),
            new_secondary_bus,
            self.secondary_bus_num(),
            self.subordinate_bus_num()
        );

        if new_secondary_bus > self.subordinate_bus_num() {
            self.assign_bus_numbers(
                cfg,
                self.primary_bus(),
                self.secondary_bus_num(),
                new_secondary_bus,
            )?;
            debug_assert_eq!(self.subordinate_bus_num(), new_secondary_bus);

            unsafe {
                let parent_bus = self.device.parent_bus();
                if !parent_bus.is_null() {
                    let parent_bridge = (*parent_bus).bridge_ptr();
                    if !parent_bridge.is_null() {
                        (*parent_bridge).extend_subordinate_range(cfg, new_secondary_bus)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite the type-1 bus number block, preserving the latency timer
    /// byte, and refresh the cache
    fn assign_bus_numbers(
        &mut self,
        cfg: &dyn ConfigAccess,
        primary: u8,
        secondary: u8,
        subordinate: u8,
    ) -> PciResult<()> {
        log::trace!(
            "PCI: bridge {} bus numbers primary {} secondary {} subordinate {}",
            self.loc(),
            primary,
            secondary,
            subordinate
        );

        let mut value = cfg.read32(self.loc(), config::BUS_NUMBERS)?;
        value &= 0xFF00_0000;
        value |= (subordinate as u32) << 16;
        value |= (secondary as u32) << 8;
        value |= primary as u32;
        cfg.write32(self.loc(), config::BUS_NUMBERS, value)?;

        self.device.load_config(cfg)
    }

    /// I/O forwarding window decoded out of the type-1 header
    pub fn io_range(&self) -> BridgeWindow {
        let cfg = self.device.config();
        if cfg.io_limit() < cfg.io_base() {
            BridgeWindow { base: 0, limit: 0 }
        } else {
            BridgeWindow {
                base: ((cfg.io_base() as u64) >> 4) << 12,
                limit: (((cfg.io_limit() as u64) >> 4) << 12) | 0xFFF,
            }
        }
    }

    /// Memory forwarding window
    pub fn mem_range(&self) -> BridgeWindow {
        let cfg = self.device.config();
        if cfg.memory_limit() < cfg.memory_base() {
            BridgeWindow { base: 0, limit: 0 }
        } else {
            BridgeWindow {
                base: ((cfg.memory_base() as u64) >> 4) << 20,
                limit: (((cfg.memory_limit() as u64) >> 4) << 20) | 0xF_FFFF,
            }
        }
    }

    /// Prefetchable memory forwarding window; honors the 64-bit upper
    /// words when the window advertises 64-bit support
    pub fn prefetch_range(&self) -> BridgeWindow {
        let cfg = self.device.config();
        if cfg.prefetchable_memory_limit() < cfg.prefetchable_memory_base() {
            return BridgeWindow { base: 0, limit: 0 };
        }

        let is_64 = cfg.prefetchable_memory_base() & 0xF == 1;
        let mut base = ((cfg.prefetchable_memory_base() as u64) >> 4) << 20;
        let mut limit = (((cfg.prefetchable_memory_limit() as u64) >> 4) << 20) | 0xF_FFFF;
        if is_64 {
            base |= (cfg.prefetchable_base_upper() as u64) << 32;
            limit |= (cfg.prefetchable_limit_upper() as u64) << 32;
        }
        BridgeWindow { base, limit }
    }

    /// Propagate aggregated child windows into the bridge window registers.
    ///
    /// TODO: sum the secondary bus's BAR requests into the io/mem/prefetch
    /// windows and write them back; the per-bus allocation batches are
    /// already sorted the way that pass will want them.
    pub(crate) fn assign_child_resources(&mut self) {}

    /// Log the bridge, its windows and its secondary bus
    pub(crate) fn dump(&self, indent: usize) {
        log::debug!(
            "{:indent$}bridge {} {:04x}:{:04x} primary bus {} child busses [{}..{}]",
            "",
            self.loc(),
            self.device.vendor_id(),
            self.device.device_id(),
            self.primary_bus(),
            self.secondary_bus_num(),
            self.subordinate_bus_num(),
            indent = indent,
        );
        let mr = self.mem_range();
        let ir = self.io_range();
        let pr = self.prefetch_range();
        log::debug!(
            "{:indent$}mem_range [{:#x}..{:#x}] io_range [{:#x}..{:#x}] pref_range [{:#x}..{:#x}]",
            "",
            mr.base,
            mr.limit,
            ir.base,
            ir.limit,
            pr.base,
            pr.limit,
            indent = indent,
        );
        if let Some(bus) = self.secondary_bus.as_deref() {
            bus.dump(indent + 1);
        }
    }
}
