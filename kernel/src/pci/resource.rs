//! PCI Resource Pools
//!
//! Tracks the address ranges handed to the bus manager for BAR assignment
//! and serves allocations out of them. Five independent pools exist: I/O,
//! 32-bit MMIO, 64-bit MMIO, and the prefetchable variants of the two MMIO
//! kinds. Allocation is first-fit bump with power-of-two alignment; a
//! 64-bit-capable request that does not fit in its 64-bit pool falls
//! through to the matching 32-bit pool before failing.

use super::{PciError, PciResult};

/// Address space kind a BAR decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciResourceKind {
    /// Port I/O range
    Io,
    /// 32-bit memory range
    Mmio,
    /// 64-bit memory range
    Mmio64,
}

/// One half-open `[base, base + size)` pool
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRange {
    pub base: u64,
    pub size: u64,
}

/// Bump allocator over the five resource pools
#[derive(Default)]
pub struct ResourceAllocator {
    io: ResourceRange,
    mmio: ResourceRange,
    mmio64: ResourceRange,
    mmio_prefetchable: ResourceRange,
    mmio64_prefetchable: ResourceRange,
}

impl ResourceAllocator {
    pub const fn new() -> Self {
        Self {
            io: ResourceRange { base: 0, size: 0 },
            mmio: ResourceRange { base: 0, size: 0 },
            mmio64: ResourceRange { base: 0, size: 0 },
            mmio_prefetchable: ResourceRange { base: 0, size: 0 },
            mmio64_prefetchable: ResourceRange { base: 0, size: 0 },
        }
    }

    fn pool(&mut self, kind: PciResourceKind, prefetchable: bool) -> PciResult<&mut ResourceRange> {
        match (kind, prefetchable) {
            (PciResourceKind::Io, false) => Ok(&mut self.io),
            (PciResourceKind::Mmio, false) => Ok(&mut self.mmio),
            (PciResourceKind::Mmio64, false) => Ok(&mut self.mmio64),
            (PciResourceKind::Mmio, true) => Ok(&mut self.mmio_prefetchable),
            (PciResourceKind::Mmio64, true) => Ok(&mut self.mmio64_prefetchable),
            (PciResourceKind::Io, true) => Err(PciError::InvalidArgs),
        }
    }

    /// Install one pool, replacing any previous range of the same kind
    pub fn set_range(
        &mut self,
        kind: PciResourceKind,
        prefetchable: bool,
        base: u64,
        size: u64,
    ) -> PciResult<()> {
        log::trace!(
            "PCI: resource pool {:?} prefetchable {} base {:#x} size {:#x}",
            kind,
            prefetchable,
            base,
            size
        );
        *self.pool(kind, prefetchable)? = ResourceRange { base, size };
        Ok(())
    }

    /// Bump-allocate from one pool, honoring `1 << align_log2` alignment
    fn bump(range: &mut ResourceRange, size: u64, align_log2: u8) -> PciResult<u64> {
        if size == 0 || align_log2 >= 64 {
            return Err(PciError::InvalidArgs);
        }
        let align = 1u64 << align_log2;
        let aligned = range
            .base
            .checked_add(align - 1)
            .ok_or(PciError::NoResources)?
            & !(align - 1);
        let end = aligned.checked_add(size).ok_or(PciError::NoResources)?;
        let pool_end = range.base.checked_add(range.size).ok_or(PciError::NoResources)?;
        if end > pool_end {
            return Err(PciError::NoResources);
        }
        range.size = pool_end - end;
        range.base = end;
        Ok(aligned)
    }

    /// Allocate a port range from the I/O pool
    pub fn allocate_io(&mut self, size: u32, align_log2: u8) -> PciResult<u32> {
        let range = self.pool(PciResourceKind::Io, false)?;
        log::trace!(
            "PCI: io pool base {:#x} size {:#x}, request size {:#x} align {}",
            range.base,
            range.size,
            size,
            align_log2
        );
        let addr = Self::bump(range, size as u64, align_log2)?;
        // I/O pools live below 4 GiB by construction.
        Ok(addr as u32)
    }

    /// Allocate a memory range
    ///
    /// A 64-bit-capable request is served from the 64-bit pool first and
    /// falls through to the matching 32-bit pool when that fails.
    pub fn allocate_mmio(
        &mut self,
        can_be_64bit: bool,
        prefetchable: bool,
        size: u64,
        align_log2: u8,
    ) -> PciResult<u64> {
        let mut can_be_64bit = can_be_64bit;
        loop {
            let kind = if can_be_64bit { PciResourceKind::Mmio64 } else { PciResourceKind::Mmio };
            let range = self.pool(kind, prefetchable)?;
            log::trace!(
                "PCI: mmio pool {:?} base {:#x} size {:#x}, request size {:#x} align {} prefetchable {}",
                kind,
                range.base,
                range.size,
                size,
                align_log2,
                prefetchable
            );

            match Self::bump(range, size, align_log2) {
                Ok(addr) => return Ok(addr),
                Err(PciError::NoResources) => {}
                Err(err) => return Err(err),
            }

            // After one failed 64-bit attempt, drop to 32-bit and retry.
            if can_be_64bit {
                can_be_64bit = false;
                continue;
            }
            return Err(PciError::NoResources);
        }
    }
}
