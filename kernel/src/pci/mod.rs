//! PCI Bus Manager
//!
//! The bus manager is responsible for:
//! - Enumerating configuration space and building the bus/bridge/device tree
//! - Assigning bus numbers to unconfigured bridges
//! - Sizing BARs and allocating I/O and MMIO space to them
//! - Enabling devices and programming legacy and message-signalled interrupts
//! - Lookup by id, class or location for driver binding
//!
//! # Architecture
//!
//! Enumeration starts at bus 0 and recurses depth-first through PCI-to-PCI
//! bridges. Every bus owns its child devices, every bridge owns its
//! secondary bus, and the manager owns the root bus plus a flat
//! discovery-ordered list of non-owning bus pointers for iteration. A WAVL
//! tree keyed by location indexes every device for O(log n) lookup.
//!
//! All state lives in one module-private singleton behind a spinlock; the
//! public `pci_bus_mgr_*` entry points lock it, which serializes bring-up
//! and later per-device requests.

pub mod bridge;
pub mod bus;
pub mod device;
pub mod resource;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::BridgeWindow;
pub use device::{PciBar, PciCapability};
pub use resource::{PciResourceKind, ResourceRange};

use crate::hal::interrupts::PlatformInterrupts;
use crate::hal::pci::{ConfigAccess, PciLocation};
use crate::rtl::wavl::WavlTree;
use crate::wavl_offset_of;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bus::{Bus, ProbeContext};
use core::ptr;
use device::Device;
use resource::ResourceAllocator;
use spin::Mutex;

/// MMIO BAR sizes are rounded up to this before allocation
pub(crate) const PAGE_SIZE: u64 = 4096;

/// PCI subsystem error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// No device at the location, or no more matches
    NotFound,
    /// Unknown header type, or an operation the core does not implement
    NotSupported,
    /// Malformed arguments, e.g. wildcarding every id
    InvalidArgs,
    /// An address pool, vector range or bus number range is exhausted
    NoResources,
    /// A configuration space access failed
    Io,
}

pub type PciResult<T> = Result<T, PciError>;

/// Global PCI state: the root bus, the flat bus list and the installed
/// platform services
struct BusManager {
    config: Box<dyn ConfigAccess + Send>,
    platform: Box<dyn PlatformInterrupts + Send>,
    root: Option<Box<Bus>>,
    /// Non-owning pointers into bridge-owned buses, discovery order
    bus_list: Vec<*mut Bus>,
    last_bus: u8,
    resources: ResourceAllocator,
    /// Location-keyed index into bus-owned device records
    device_index: WavlTree<Device, PciLocation>,
}

// The raw pointers all target heap records owned by this same structure;
// the singleton lock serializes every access.
unsafe impl Send for BusManager {}

fn device_location(device: &Device) -> PciLocation {
    device.loc()
}

impl BusManager {
    fn new(
        config: Box<dyn ConfigAccess + Send>,
        platform: Box<dyn PlatformInterrupts + Send>,
    ) -> Self {
        Self {
            config,
            platform,
            root: None,
            bus_list: Vec::new(),
            last_bus: 0,
            resources: ResourceAllocator::new(),
            device_index: WavlTree::new(device_location, wavl_offset_of!(Device, index_links)),
        }
    }

    /// Drill into the bus tree starting at 0000:00:00.0
    fn probe(&mut self) -> PciResult<()> {
        let mut ctx = ProbeContext::new(&*self.config);
        let mut root = Bus::probe(&mut ctx, PciLocation::default(), ptr::null_mut(), true)?;
        let root_ptr: *mut Bus = &mut *root;

        self.last_bus = ctx.last_bus;
        self.bus_list = ctx.bus_list;
        self.root = Some(root);

        // the root bus leads the flat list; child buses follow in the
        // order their bridges finished probing
        self.bus_list.insert(0, root_ptr);
        Ok(())
    }

    /// Index every device by location
    ///
    /// Must run only once the manager sits at its final address: the index
    /// sentinels encode the container address.
    fn build_index(&mut self) {
        debug_assert!(self.device_index.is_empty());
        for &bus in &self.bus_list {
            unsafe {
                for child in (*bus).children_mut() {
                    let device: *mut Device = child.device_mut();
                    let (inserted, _) = self.device_index.insert_or_find(device);
                    if !inserted {
                        log::warn!("PCI: duplicate device location {}", (*device).loc());
                    }
                }
            }
        }
    }

    fn device_ptr(&self, loc: PciLocation) -> PciResult<*mut Device> {
        let found = self.device_index.find(&loc);
        if found.is_null() {
            Err(PciError::NotFound)
        } else {
            Ok(found)
        }
    }

    /// Call `f` on every device in discovery order until it asks to stop
    fn for_each_device(&self, f: &mut dyn FnMut(&Device) -> bool) {
        for &bus in &self.bus_list {
            unsafe {
                for child in (*bus).children() {
                    if !f(child.device()) {
                        return;
                    }
                }
            }
        }
    }

    fn add_resource(
        &mut self,
        kind: PciResourceKind,
        prefetchable: bool,
        base: u64,
        size: u64,
    ) -> PciResult<()> {
        self.resources.set_range(kind, prefetchable, base, size)
    }

    fn assign_resources(&mut self) -> PciResult<()> {
        let BusManager { ref config, ref mut root, ref mut resources, .. } = *self;
        let root = match root.as_mut() {
            Some(root) => root,
            None => return Ok(()),
        };
        root.allocate_resources(&**config, resources)?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("PCI dump post assign:");
            root.dump(2);
        }
        Ok(())
    }

    fn find_device(
        &self,
        device_id: u16,
        vendor_id: u16,
        index: usize,
    ) -> PciResult<PciLocation> {
        if device_id == 0xFFFF && vendor_id == 0xFFFF {
            return Err(PciError::InvalidArgs);
        }

        let mut remaining = index;
        let mut found = None;
        self.for_each_device(&mut |device| {
            if device_id != 0xFFFF && device_id != device.device_id() {
                return true;
            }
            if vendor_id != 0xFFFF && vendor_id != device.vendor_id() {
                return true;
            }
            if remaining == 0 {
                found = Some(device.loc());
                return false;
            }
            remaining -= 1;
            true
        });
        found.ok_or(PciError::NotFound)
    }

    fn find_device_by_class(
        &self,
        base_class: u8,
        sub_class: u8,
        interface: u8,
        index: usize,
    ) -> PciResult<PciLocation> {
        if sub_class == 0xFF && interface == 0xFF {
            return Err(PciError::InvalidArgs);
        }

        let mut remaining = index;
        let mut found = None;
        self.for_each_device(&mut |device| {
            if base_class != device.base_class() {
                return true;
            }
            if sub_class != 0xFF && sub_class != device.sub_class() {
                return true;
            }
            if interface != 0xFF && interface != device.prog_if() {
                return true;
            }
            if remaining == 0 {
                found = Some(device.loc());
                return false;
            }
            remaining -= 1;
            true
        });
        found.ok_or(PciError::NotFound)
    }

    fn lookup_bus(&self, bus_num: u8) -> Option<&Bus> {
        for &bus in &self.bus_list {
            unsafe {
                if (*bus).bus_num() == bus_num {
                    return Some(&*bus);
                }
            }
        }
        None
    }

    fn dump(&self) {
        if let Some(root) = self.root.as_deref() {
            root.dump(2);
        }
    }
}

/// The bus manager singleton. Taking the lock is what serializes the
/// `pci_bus_mgr_*` entry points.
static BUS_MGR: Mutex<Option<BusManager>> = Mutex::new(None);

fn with_manager<R>(f: impl FnOnce(&mut BusManager) -> PciResult<R>) -> PciResult<R> {
    let mut guard = BUS_MGR.lock();
    match guard.as_mut() {
        Some(manager) => f(manager),
        None => Err(PciError::NotFound),
    }
}

/// Install the platform accessors and probe the whole bus tree
///
/// Bus numbers are assigned during the probe; no resources are allocated
/// yet. On failure the root stays unset and later queries come back with
/// zero matches.
pub fn pci_bus_mgr_init(
    config: Box<dyn ConfigAccess + Send>,
    platform: Box<dyn PlatformInterrupts + Send>,
) -> PciResult<()> {
    let mut guard = BUS_MGR.lock();
    *guard = Some(BusManager::new(config, platform));

    let result = guard.as_mut().unwrap().probe();
    if let Err(err) = result {
        log::error!("PCI: failed to probe bus, error {:?}", err);
        return Err(err);
    }

    let manager = guard.as_mut().unwrap();
    manager.build_index();
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("PCI dump:");
        manager.dump();
    }
    Ok(())
}

/// Install one address pool for BAR allocation
pub fn pci_bus_mgr_add_resource(
    kind: PciResourceKind,
    prefetchable: bool,
    base: u64,
    size: u64,
) -> PciResult<()> {
    log::trace!(
        "PCI: add resource {:?} prefetchable {} base {:#x} len {:#x}",
        kind,
        prefetchable,
        base,
        size
    );
    with_manager(|manager| manager.add_resource(kind, prefetchable, base, size))
}

/// Sort and allocate every BAR out of the installed pools
pub fn pci_bus_mgr_assign_resources() -> PciResult<()> {
    let mut guard = BUS_MGR.lock();
    match guard.as_mut() {
        Some(manager) => manager.assign_resources(),
        None => Ok(()),
    }
}

/// Call `f` with every device location in discovery order
pub fn pci_bus_mgr_visit_devices(mut f: impl FnMut(PciLocation)) -> PciResult<()> {
    let mut guard = BUS_MGR.lock();
    if let Some(manager) = guard.as_mut() {
        manager.for_each_device(&mut |device| {
            f(device.loc());
            true
        });
    }
    Ok(())
}

/// Locate the `index`th device matching the given ids; `0xFFFF` wildcards
/// either id, but not both
pub fn pci_bus_mgr_find_device(
    out: &mut PciLocation,
    device_id: u16,
    vendor_id: u16,
    index: usize,
) -> PciResult<()> {
    with_manager(|manager| {
        *out = manager.find_device(device_id, vendor_id, index)?;
        Ok(())
    })
}

/// Locate the `index`th device matching the class triple; `0xFF` wildcards
/// the subclass or interface, but not both
pub fn pci_bus_mgr_find_device_by_class(
    out: &mut PciLocation,
    base_class: u8,
    sub_class: u8,
    interface: u8,
    index: usize,
) -> PciResult<()> {
    with_manager(|manager| {
        *out = manager.find_device_by_class(base_class, sub_class, interface, index)?;
        Ok(())
    })
}

/// Turn on IO, MEM and bus-master decode for a device
pub fn pci_bus_mgr_enable_device(loc: PciLocation) -> PciResult<()> {
    with_manager(|manager| {
        let device = manager.device_ptr(loc)?;
        unsafe { (*device).enable(&*manager.config) }
    })
}

/// Copy the cached BAR array of a device
pub fn pci_bus_mgr_read_bars(loc: PciLocation, out: &mut [PciBar; 6]) -> PciResult<()> {
    with_manager(|manager| {
        let device = manager.device_ptr(loc)?;
        *out = unsafe { (*device).read_bars() };
        Ok(())
    })
}

/// Map a device's legacy interrupt line to a platform vector
pub fn pci_bus_mgr_allocate_irq(loc: PciLocation, vector: &mut u32) -> PciResult<()> {
    *vector = 0;
    with_manager(|manager| {
        let device = manager.device_ptr(loc)?;
        *vector = unsafe { (*device).allocate_irq(&*manager.config, &*manager.platform)? };
        Ok(())
    })
}

/// Allocate platform vectors and program a device's MSI capability
pub fn pci_bus_mgr_allocate_msi(
    loc: PciLocation,
    count: usize,
    vector_base: &mut u32,
) -> PciResult<()> {
    *vector_base = 0;
    with_manager(|manager| {
        let device = manager.device_ptr(loc)?;
        let BusManager { ref config, ref mut platform, .. } = *manager;
        *vector_base = unsafe { (*device).allocate_msi(&**config, &mut **platform, count)? };
        Ok(())
    })
}

/// Location of the bus with the given number, if it was discovered
pub fn pci_bus_mgr_lookup_bus(bus_num: u8) -> PciResult<PciLocation> {
    with_manager(|manager| {
        manager.lookup_bus(bus_num).map(|bus| bus.loc()).ok_or(PciError::NotFound)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testutil::{StubConfigSpace, StubFunction};
    use crate::hal::interrupts::FixedPolicyInterrupts;

    // Boxed so the location index can be built at the manager's final
    // address before the helper returns.
    fn bring_up(stub: &StubConfigSpace) -> Box<BusManager> {
        let mut manager = Box::new(BusManager::new(
            Box::new(stub.clone()),
            Box::new(FixedPolicyInterrupts::new(0x40, 32, 0x20)),
        ));
        manager.probe().unwrap();
        manager.build_index();
        manager
    }

    fn collect_locations(manager: &BusManager) -> Vec<PciLocation> {
        let mut locations = Vec::new();
        manager.for_each_device(&mut |device| {
            locations.push(device.loc());
            true
        });
        locations
    }

    #[test]
    fn test_bus_tree_discovery() {
        let mut stub = StubConfigSpace::new();
        stub.add(PciLocation::new(0, 0, 0, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 0, 1, 0), StubFunction::device(0x8086, 0x1000));

        let manager = bring_up(&stub);
        assert_eq!(manager.bus_list.len(), 2);
        assert_eq!(stub.reg8(PciLocation::new(0, 0, 0, 0), 0x19), 1);

        let loc = manager.find_device(0x1000, 0x8086, 0).unwrap();
        assert_eq!(loc, PciLocation::new(0, 0, 1, 0));
    }

    #[test]
    fn test_visit_covers_every_function() {
        let mut stub = StubConfigSpace::new();
        let mut multi = StubFunction::device(0x8086, 0x1000);
        multi.set_multifunction();
        stub.add(PciLocation::new(0, 0, 2, 0), multi);
        stub.add(PciLocation::new(0, 0, 2, 5), StubFunction::device(0x8086, 0x1001));
        stub.add(PciLocation::new(0, 0, 3, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 1, 0, 0), StubFunction::device(0x10EC, 0x8139));
        // a function only reachable through an unscanned bus is invisible
        stub.add(PciLocation::new(0, 7, 0, 0), StubFunction::device(0x1AF4, 0x1041));

        let manager = bring_up(&stub);
        let locations = collect_locations(&manager);
        assert_eq!(
            locations,
            [
                PciLocation::new(0, 0, 2, 0),
                PciLocation::new(0, 0, 2, 5),
                PciLocation::new(0, 0, 3, 0),
                PciLocation::new(0, 1, 0, 0),
            ]
        );
    }

    #[test]
    fn test_bus_number_invariants() {
        let mut stub = StubConfigSpace::new();
        // two sibling bridges on bus 0, one of them nested
        stub.add(PciLocation::new(0, 0, 0, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 1, 3, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 0, 4, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 2, 1, 0), StubFunction::device(0x8086, 0x1000));

        let manager = bring_up(&stub);
        assert_eq!(manager.bus_list.len(), 4);
        assert_eq!(manager.last_bus, 3);

        fn check_bus(bus: &Bus) {
            for child in bus.children() {
                if let bus::BusChild::Bridge(bridge) = child {
                    assert_eq!(bridge.primary_bus(), bus.bus_num());
                    assert!(bridge.secondary_bus_num() <= bridge.subordinate_bus_num());
                    assert!(bridge.secondary_bus_num() > bus.bus_num());
                    let secondary = bridge.secondary_bus().unwrap();
                    assert_eq!(secondary.bus_num(), bridge.secondary_bus_num());
                    // every descendant bus sits inside the bridge's range
                    fn check_descendants(bus: &Bus, lo: u8, hi: u8) {
                        assert!(bus.bus_num() >= lo && bus.bus_num() <= hi);
                        for child in bus.children() {
                            if let bus::BusChild::Bridge(bridge) = child {
                                check_descendants(bridge.secondary_bus().unwrap(), lo, hi);
                            }
                        }
                    }
                    check_descendants(
                        secondary,
                        bridge.secondary_bus_num(),
                        bridge.subordinate_bus_num(),
                    );
                    check_bus(secondary);
                }
            }
        }
        check_bus(manager.root.as_deref().unwrap());
    }

    #[test]
    fn test_find_device_wildcards() {
        let mut stub = StubConfigSpace::new();
        stub.add(PciLocation::new(0, 0, 1, 0), StubFunction::device(0x8086, 0x1000));
        stub.add(PciLocation::new(0, 0, 2, 0), StubFunction::device(0x8086, 0x1001));
        stub.add(PciLocation::new(0, 0, 3, 0), StubFunction::device(0x10EC, 0x8139));

        let manager = bring_up(&stub);

        // both ids wildcarded is malformed
        assert_eq!(manager.find_device(0xFFFF, 0xFFFF, 0), Err(PciError::InvalidArgs));

        // nth match with a wildcard device id
        assert_eq!(
            manager.find_device(0xFFFF, 0x8086, 1).unwrap(),
            PciLocation::new(0, 0, 2, 0)
        );
        // exact match
        assert_eq!(
            manager.find_device(0x8139, 0x10EC, 0).unwrap(),
            PciLocation::new(0, 0, 3, 0)
        );
        // index past the matches
        assert_eq!(manager.find_device(0xFFFF, 0x8086, 2), Err(PciError::NotFound));
    }

    #[test]
    fn test_find_device_by_class() {
        let mut stub = StubConfigSpace::new();
        let mut nvme = StubFunction::device(0x8086, 0x1000);
        nvme.set_class(0x01, 0x08, 0x02);
        let mut sata = StubFunction::device(0x8086, 0x1001);
        sata.set_class(0x01, 0x06, 0x01);
        let mut net = StubFunction::device(0x10EC, 0x8139);
        net.set_class(0x02, 0x00, 0x00);
        stub.add(PciLocation::new(0, 0, 1, 0), nvme);
        stub.add(PciLocation::new(0, 0, 2, 0), sata);
        stub.add(PciLocation::new(0, 0, 3, 0), net);

        let manager = bring_up(&stub);

        assert_eq!(
            manager.find_device_by_class(0x01, 0xFF, 0xFF, 0),
            Err(PciError::InvalidArgs)
        );
        // subclass wildcard walks every mass storage controller
        assert_eq!(
            manager.find_device_by_class(0x01, 0xFF, 0x02, 0).unwrap(),
            PciLocation::new(0, 0, 1, 0)
        );
        assert_eq!(
            manager.find_device_by_class(0x01, 0x06, 0xFF, 0).unwrap(),
            PciLocation::new(0, 0, 2, 0)
        );
        assert_eq!(
            manager.find_device_by_class(0x02, 0x00, 0x00, 0).unwrap(),
            PciLocation::new(0, 0, 3, 0)
        );
        assert_eq!(
            manager.find_device_by_class(0x03, 0x00, 0xFF, 0),
            Err(PciError::NotFound)
        );
    }

    #[test]
    fn test_assign_resources_round_trip() {
        let mut stub = StubConfigSpace::new();
        let mut f = StubFunction::device(0x8086, 0x1000);
        f.set_bar_mem32(0, 0, 0x1_0000, false);
        f.set_bar_io(1, 0, 0x20);
        f.set_bar_mem64(2, 0, 0x10_0000, false);
        stub.add(PciLocation::new(0, 0, 1, 0), f);

        let mut manager = bring_up(&stub);
        manager.add_resource(PciResourceKind::Io, false, 0x1000, 0x1000).unwrap();
        manager
            .add_resource(PciResourceKind::Mmio, false, 0x8000_0000, 0x1000_0000)
            .unwrap();
        manager
            .add_resource(PciResourceKind::Mmio64, false, 0x1_0000_0000, 0x1_0000_0000)
            .unwrap();
        manager.assign_resources().unwrap();

        // for every valid BAR the cache equals a masked re-read of the
        // hardware register
        let loc = PciLocation::new(0, 0, 1, 0);
        let device = manager.device_ptr(loc).unwrap();
        let bars = unsafe { (*device).read_bars() };

        assert!(bars[0].valid && !bars[0].io);
        assert_eq!(bars[0].addr, (stub.reg32(loc, 0x10) & 0xFFFF_FFF0) as u64);

        assert!(bars[1].valid && bars[1].io);
        assert_eq!(bars[1].addr, (stub.reg32(loc, 0x14) & 0xFFFF_FFFC) as u64);

        assert!(bars[2].valid && bars[2].size_64);
        let lo = (stub.reg32(loc, 0x18) & 0xFFFF_FFF0) as u64;
        let hi = stub.reg32(loc, 0x1C) as u64;
        assert_eq!(bars[2].addr, lo | (hi << 32));
        assert_eq!(bars[2].addr, 0x1_0000_0000);
    }

    #[test]
    fn test_enable_and_interrupts() {
        let mut stub = StubConfigSpace::new();
        let mut f = StubFunction::device(0x8086, 0x1000);
        f.set_interrupt_line(5);
        f.set_capabilities(&[(0x50, crate::hal::pci::capability::MSI)]);
        stub.add(PciLocation::new(0, 0, 1, 0), f);

        let mut manager = bring_up(&stub);
        let loc = PciLocation::new(0, 0, 1, 0);

        let device = manager.device_ptr(loc).unwrap();
        unsafe { (*device).enable(&*manager.config).unwrap() };
        assert_eq!(stub.reg16(loc, 0x04) & 0x7, 0x7);

        // legacy mapping goes through the platform service
        let vector =
            unsafe { (*device).allocate_irq(&*manager.config, &*manager.platform).unwrap() };
        assert_eq!(vector, 0x25);

        // MSI programming uses the platform's message encoding
        let BusManager { ref config, ref mut platform, .. } = *manager;
        let base = unsafe { (*device).allocate_msi(&**config, &mut **platform, 1).unwrap() };
        assert_eq!(base, 0x40);
        assert_eq!(stub.reg16(loc, 0x52), 0x0001);
        assert_eq!(stub.reg32(loc, 0x54), 0xFEE0_0000);
        assert_eq!(stub.reg8(loc, 0x3C), 0x40);

        // unknown locations fail cleanly
        assert_eq!(
            manager.device_ptr(PciLocation::new(0, 0, 9, 0)),
            Err(PciError::NotFound)
        );
    }

    #[test]
    fn test_lookup_bus() {
        let mut stub = StubConfigSpace::new();
        stub.add(PciLocation::new(0, 0, 0, 0), StubFunction::bridge(0x8086, 0x2448));

        let manager = bring_up(&stub);
        assert_eq!(manager.lookup_bus(0).unwrap().bus_num(), 0);
        assert_eq!(manager.lookup_bus(1).unwrap().bus_num(), 1);
        assert!(manager.lookup_bus(2).is_none());
    }

    #[test]
    fn test_empty_probe_keeps_quiet() {
        let stub = StubConfigSpace::new();
        let manager = bring_up(&stub);
        assert!(collect_locations(&manager).is_empty());
        assert_eq!(manager.find_device(0xFFFF, 0x8086, 0), Err(PciError::NotFound));
    }

    // The global entry points share one singleton, so a single test
    // exercises the whole public surface in sequence.
    #[test]
    fn test_global_entry_points() {
        let mut stub = StubConfigSpace::new();
        let mut f = StubFunction::device(0x8086, 0x1000);
        f.set_bar_mem32(0, 0, 0x1000, false);
        f.set_interrupt_line(9);
        f.set_capabilities(&[(0x50, crate::hal::pci::capability::MSI)]);
        stub.add(PciLocation::new(0, 0, 1, 0), f);
        stub.add(PciLocation::new(0, 0, 2, 0), StubFunction::bridge(0x8086, 0x2448));
        stub.add(PciLocation::new(0, 1, 0, 0), StubFunction::device(0x10EC, 0x8139));

        pci_bus_mgr_init(
            Box::new(stub.clone()),
            Box::new(FixedPolicyInterrupts::new(0x60, 16, 0x20)),
        )
        .unwrap();

        pci_bus_mgr_add_resource(PciResourceKind::Mmio, false, 0x8000_0000, 0x100_0000)
            .unwrap();
        pci_bus_mgr_assign_resources().unwrap();

        let mut visited = Vec::new();
        pci_bus_mgr_visit_devices(|loc| visited.push(loc)).unwrap();
        assert_eq!(visited.len(), 3);
        assert_eq!(visited[0], PciLocation::new(0, 0, 1, 0));

        let mut loc = PciLocation::default();
        pci_bus_mgr_find_device(&mut loc, 0x8139, 0x10EC, 0).unwrap();
        assert_eq!(loc, PciLocation::new(0, 1, 0, 0));

        let dev = PciLocation::new(0, 0, 1, 0);
        pci_bus_mgr_enable_device(dev).unwrap();
        assert_eq!(stub.reg16(dev, 0x04) & 0x7, 0x7);

        let mut bars = [PciBar::default(); 6];
        pci_bus_mgr_read_bars(dev, &mut bars).unwrap();
        assert!(bars[0].valid);
        assert_eq!(bars[0].addr, 0x8000_0000);

        let mut vector = 0;
        pci_bus_mgr_allocate_irq(dev, &mut vector).unwrap();
        assert_eq!(vector, 0x29);

        let mut base = 0;
        pci_bus_mgr_allocate_msi(dev, 1, &mut base).unwrap();
        assert_eq!(base, 0x60);
        assert_eq!(stub.reg8(dev, 0x3C), 0x60);

        assert_eq!(pci_bus_mgr_lookup_bus(1).unwrap(), PciLocation::new(0, 1, 0, 0));
        assert!(pci_bus_mgr_lookup_bus(9).is_err());
    }
}
