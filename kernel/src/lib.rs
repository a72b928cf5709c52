//! Meridian Kernel Core
//!
//! The portable core of the Meridian kernel. Everything here is
//! `no_std` + `alloc` and free of board glue, so the subsystems build and
//! test on a host toolchain while the same code runs under the kernel
//! proper.
//!
//! # Subsystems
//!
//! - **hal** - Hardware Abstraction Layer: PCI configuration space access
//!   and platform interrupt services
//! - **rtl** - Runtime Library: intrusive data structures
//! - **pci** - PCI bus manager: enumeration, bus numbering, resource
//!   assignment, interrupt programming
//!
//! # Diagnostics
//!
//! All output goes through the `log` facade; the embedder installs the
//! sink (serial, framebuffer, test capture).

#![no_std]
// Kernel-specific lint configuration:
// - not_unsafe_ptr_arg_deref: intrusive containers traffic in raw node
//   pointers whose validity is a documented caller contract
// - new_without_default: constructors with hardware side conditions should
//   be spelled out, not implied by Default
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod hal;
pub mod pci;
pub mod rtl;
