//! Address newtypes shared by the transport core and its test fakes.
//!
//! Keeping `PhysAddr`/`VirtAddr` in their own crate means the virtqueue
//! engine and the host-side capability walker agree on one representation
//! of guest-physical and kernel-virtual addresses instead of passing raw
//! `u64`s across the boundary.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;

/// Standard 4KB page size, used for alignment checks on DMA memory.
pub const PAGE_SIZE: u64 = 0x1000;

pub use addr::*;
