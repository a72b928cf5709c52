//! Hardware Abstraction Layer (hal)
//!
//! The HAL provides hardware abstraction for portability:
//!
//! - **PCI**: Configuration space addressing and access mechanisms
//! - **Interrupts**: Platform vector allocation and MSI message computation
//!
//! Higher layers never touch ports or MMIO windows directly; they consume
//! the `ConfigAccess` and `PlatformInterrupts` traits exported here.

pub mod interrupts;
pub mod pci;

pub use interrupts::{FixedPolicyInterrupts, PlatformInterrupts};
pub use pci::{ConfigAccess, EcamConfigAccess, PciConfig, PciLocation};

#[cfg(target_arch = "x86_64")]
pub use pci::PortIoConfigAccess;
