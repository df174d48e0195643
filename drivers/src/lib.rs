//! Guest-side virtio 1.0 PCI transport: capability discovery, feature
//! negotiation, device-config access, and the split-ring virtqueue engine.
//!
//! Device personalities (block, net, ...) and the kernel glue behind
//! [`virtio::hsi::HostServices`] live outside this crate.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod error;
pub mod log;
pub mod pci_defs;
pub mod virtio;
