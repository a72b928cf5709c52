//! In-memory PCI configuration space for tests
//!
//! Models a set of functions as raw 256-byte register files with proper
//! BAR semantics: writes to a BAR slot land only in the slot's writable
//! address bits and the hardwired low bits read back unchanged, so the
//! write-ones size probe behaves like real hardware. Absent functions
//! float all-ones.

use crate::hal::pci::{ConfigAccess, PciLocation, PCI_CONFIG_LEN};
use crate::pci::PciResult;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// One stub function's register file
pub struct StubFunction {
    pub bytes: [u8; PCI_CONFIG_LEN],
    /// Writable address bits per BAR slot (the size mask)
    pub bar_mask: [u32; 6],
    /// Hardwired low bits per BAR slot
    pub bar_flags: [u32; 6],
    /// Set when a BAR is rewritten while IO or MEM decode is enabled
    pub decode_violation: bool,
}

impl StubFunction {
    fn blank() -> Self {
        Self {
            bytes: [0; PCI_CONFIG_LEN],
            bar_mask: [0; 6],
            bar_flags: [0; 6],
            decode_violation: false,
        }
    }

    /// A type-0 function with the given ids
    pub fn device(vendor: u16, device: u16) -> Self {
        let mut f = Self::blank();
        f.set16(0x00, vendor);
        f.set16(0x02, device);
        f
    }

    /// A type-1 PCI-to-PCI bridge with unassigned bus numbers
    pub fn bridge(vendor: u16, device: u16) -> Self {
        let mut f = Self::blank();
        f.set16(0x00, vendor);
        f.set16(0x02, device);
        f.bytes[0x0A] = 0x04; // subclass: PCI-to-PCI
        f.bytes[0x0B] = 0x06; // class: bridge
        f.bytes[0x0E] = 0x01; // type-1 header
        f
    }

    pub fn set8(&mut self, offset: usize, value: u8) -> &mut Self {
        self.bytes[offset] = value;
        self
    }

    pub fn set16(&mut self, offset: usize, value: u16) -> &mut Self {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn set32(&mut self, offset: usize, value: u32) -> &mut Self {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn get8(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn get16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    pub fn get32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    pub fn set_class(&mut self, base: u8, sub: u8, prog_if: u8) -> &mut Self {
        self.bytes[0x0B] = base;
        self.bytes[0x0A] = sub;
        self.bytes[0x09] = prog_if;
        self
    }

    pub fn set_multifunction(&mut self) -> &mut Self {
        self.bytes[0x0E] |= 0x80;
        self
    }

    pub fn set_interrupt_line(&mut self, line: u8) -> &mut Self {
        self.bytes[0x3C] = line;
        self
    }

    /// Install a 32-bit memory BAR. `size` must be a power of two.
    pub fn set_bar_mem32(&mut self, index: usize, addr: u32, size: u32, prefetchable: bool) -> &mut Self {
        debug_assert!(size.is_power_of_two());
        let flags = if prefetchable { 1 << 3 } else { 0 };
        self.bar_flags[index] = flags;
        self.bar_mask[index] = !(size - 1) & 0xFFFF_FFF0;
        self.set32(0x10 + index * 4, (addr & 0xFFFF_FFF0) | flags);
        self
    }

    /// Install a 64-bit memory BAR occupying `index` and `index + 1`
    pub fn set_bar_mem64(&mut self, index: usize, addr: u64, size: u64, prefetchable: bool) -> &mut Self {
        debug_assert!(size.is_power_of_two());
        let flags = 0b100 | if prefetchable { 1 << 3 } else { 0 };
        let mask = !(size - 1);
        self.bar_flags[index] = flags;
        self.bar_mask[index] = (mask as u32) & 0xFFFF_FFF0;
        self.bar_flags[index + 1] = 0;
        self.bar_mask[index + 1] = (mask >> 32) as u32;
        self.set32(0x10 + index * 4, ((addr as u32) & 0xFFFF_FFF0) | flags);
        self.set32(0x10 + (index + 1) * 4, (addr >> 32) as u32);
        self
    }

    /// Install an I/O BAR. `size` must be a power of two.
    pub fn set_bar_io(&mut self, index: usize, addr: u16, size: u16) -> &mut Self {
        debug_assert!(size.is_power_of_two());
        self.bar_flags[index] = 0b01;
        self.bar_mask[index] = (!(size as u32 - 1)) & 0x0000_FFFC;
        self.set32(0x10 + index * 4, (addr as u32 & 0xFFFC) | 0b01);
        self
    }

    /// Chain capability headers at the given offsets and flag the status
    /// register. Capability bodies are left zeroed for tests to fill in.
    pub fn set_capabilities(&mut self, caps: &[(u8, u8)]) -> &mut Self {
        let status = self.get16(0x06) | 0x0010;
        self.set16(0x06, status);
        self.bytes[0x34] = caps.first().map(|&(offset, _)| offset).unwrap_or(0);
        for (i, &(offset, id)) in caps.iter().enumerate() {
            self.bytes[offset as usize] = id;
            let next = caps.get(i + 1).map(|&(o, _)| o).unwrap_or(0);
            self.bytes[offset as usize + 1] = next;
        }
        self
    }

    /// Index of the BAR slot covering a 32-bit write at `offset`, honoring
    /// the two-slot window of a type-1 header
    fn bar_slot(&self, offset: usize) -> Option<usize> {
        let bar_count = if self.bytes[0x0E] & 0x7F == 0x01 { 2 } else { 6 };
        if (0x10..0x10 + bar_count * 4).contains(&offset) && offset % 4 == 0 {
            Some((offset - 0x10) / 4)
        } else {
            None
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        if let Some(slot) = self.bar_slot(offset) {
            if self.get16(0x04) & 0x0003 != 0 {
                self.decode_violation = true;
            }
            let stored = (value & self.bar_mask[slot]) | self.bar_flags[slot];
            self.set32(offset, stored);
        } else {
            self.set32(offset, value);
        }
    }
}

/// A whole configuration space: a map of locations to register files
///
/// Clones share the same register files, so a test can keep a handle for
/// assertions after moving a clone into the bus manager.
#[derive(Clone)]
pub struct StubConfigSpace {
    functions: Arc<Mutex<BTreeMap<PciLocation, StubFunction>>>,
}

impl StubConfigSpace {
    pub fn new() -> Self {
        Self { functions: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    pub fn add(&mut self, loc: PciLocation, function: StubFunction) {
        self.functions.lock().insert(loc, function);
    }

    /// Inspect or mutate one function's register file
    pub fn with_function<R>(
        &self,
        loc: PciLocation,
        f: impl FnOnce(&mut StubFunction) -> R,
    ) -> Option<R> {
        self.functions.lock().get_mut(&loc).map(f)
    }

    /// Current raw value of a 32-bit register, for assertions
    pub fn reg32(&self, loc: PciLocation, offset: usize) -> u32 {
        self.with_function(loc, |f| f.get32(offset)).expect("no such function")
    }

    pub fn reg16(&self, loc: PciLocation, offset: usize) -> u16 {
        self.with_function(loc, |f| f.get16(offset)).expect("no such function")
    }

    pub fn reg8(&self, loc: PciLocation, offset: usize) -> u8 {
        self.with_function(loc, |f| f.get8(offset)).expect("no such function")
    }
}

impl ConfigAccess for StubConfigSpace {
    fn read8(&self, loc: PciLocation, offset: u16) -> PciResult<u8> {
        Ok(self
            .functions
            .lock()
            .get(&loc)
            .map(|f| f.get8(offset as usize))
            .unwrap_or(0xFF))
    }

    fn read16(&self, loc: PciLocation, offset: u16) -> PciResult<u16> {
        Ok(self
            .functions
            .lock()
            .get(&loc)
            .map(|f| f.get16(offset as usize))
            .unwrap_or(0xFFFF))
    }

    fn read32(&self, loc: PciLocation, offset: u16) -> PciResult<u32> {
        Ok(self
            .functions
            .lock()
            .get(&loc)
            .map(|f| f.get32(offset as usize))
            .unwrap_or(0xFFFF_FFFF))
    }

    fn write8(&self, loc: PciLocation, offset: u16, value: u8) -> PciResult<()> {
        if let Some(f) = self.functions.lock().get_mut(&loc) {
            f.set8(offset as usize, value);
        }
        Ok(())
    }

    fn write16(&self, loc: PciLocation, offset: u16, value: u16) -> PciResult<()> {
        if let Some(f) = self.functions.lock().get_mut(&loc) {
            f.set16(offset as usize, value);
        }
        Ok(())
    }

    fn write32(&self, loc: PciLocation, offset: u16, value: u32) -> PciResult<()> {
        if let Some(f) = self.functions.lock().get_mut(&loc) {
            f.write32(offset as usize, value);
        }
        Ok(())
    }
}
