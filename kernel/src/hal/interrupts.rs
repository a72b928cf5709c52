//! Platform Interrupt Services
//!
//! The PCI bus manager needs three things from the platform's interrupt
//! controller: a contiguous range of vectors for message-signalled
//! interrupts, the MSI doorbell address/data pair for a vector, and a
//! translation from legacy INTx line numbers to platform vectors. The
//! [`PlatformInterrupts`] trait abstracts all three so the bus manager stays
//! independent of the interrupt controller driver.

use crate::pci::{PciError, PciResult};

/// Interrupt services consumed by the PCI bus manager
pub trait PlatformInterrupts {
    /// Allocate `count` consecutive platform vectors, returning the base
    fn allocate_vectors(&mut self, count: usize) -> PciResult<u32>;

    /// Compute the MSI `(address, data)` pair that raises `vector`
    fn msi_values(&self, vector: u32) -> PciResult<(u64, u16)>;

    /// Map a legacy PCI interrupt line to a platform vector
    fn legacy_irq_to_vector(&self, line: u8) -> PciResult<u32>;
}

/// MSI doorbell base address for local APIC delivery
const MSI_ADDRESS_BASE: u64 = 0xFEE0_0000;

/// Simple arithmetic interrupt policy
///
/// Vectors are handed out from a bump counter, MSI messages target the
/// boot CPU's local APIC with the vector as data, and legacy lines map at a
/// fixed offset. Platforms with real routing tables supply their own
/// [`PlatformInterrupts`] implementation instead.
pub struct FixedPolicyInterrupts {
    next_vector: u32,
    limit: u32,
    legacy_base: u32,
}

impl FixedPolicyInterrupts {
    pub const fn new(base_vector: u32, count: u32, legacy_base: u32) -> Self {
        Self {
            next_vector: base_vector,
            limit: base_vector + count,
            legacy_base,
        }
    }
}

impl PlatformInterrupts for FixedPolicyInterrupts {
    fn allocate_vectors(&mut self, count: usize) -> PciResult<u32> {
        if count == 0 {
            return Err(PciError::InvalidArgs);
        }
        let base = self.next_vector;
        let end = base.checked_add(count as u32).ok_or(PciError::NoResources)?;
        if end > self.limit {
            return Err(PciError::NoResources);
        }
        self.next_vector = end;
        Ok(base)
    }

    fn msi_values(&self, vector: u32) -> PciResult<(u64, u16)> {
        if vector > 0xFF {
            return Err(PciError::InvalidArgs);
        }
        // Destination id 0, fixed delivery mode, vector in the low data byte.
        Ok((MSI_ADDRESS_BASE, vector as u16))
    }

    fn legacy_irq_to_vector(&self, line: u8) -> PciResult<u32> {
        Ok(self.legacy_base + line as u32)
    }
}
