//! Runtime Library (rtl)
//!
//! Self-contained data structures and utilities shared by the kernel
//! subsystems:
//!
//! - **wavl**: intrusive rank-balanced ordered map

pub mod wavl;

pub use wavl::{WavlLinks, WavlMap, WavlTree};
