//! VirtIO 1.0 guest-side PCI transport core.
//!
//! Capability discovery, feature negotiation, device-config access, and the
//! split-ring virtqueue engine. Device personalities (block, net, ...) and
//! the kernel glue that backs [`hsi::HostServices`] live outside this crate.

pub mod cap;
pub mod hsi;
pub mod mmio;
pub mod orchestrator;
pub mod queue;
pub mod transport;

#[cfg(test)]
pub mod testkit;

use cap::CapabilityInfo;
use mmio::MmioRegion;

// =============================================================================
// VirtIO PCI Capability Types
// =============================================================================

pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 0x01;
pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 0x02;
pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 0x03;
pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 0x04;
pub const VIRTIO_PCI_CAP_PCI_CFG: u8 = 0x05;

// =============================================================================
// VirtIO Device Status Bits
// =============================================================================

bitflags::bitflags! {
    /// Typed view of the device status byte (common-cfg `device_status`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 0x01;
        const DRIVER = 0x02;
        const DRIVER_OK = 0x04;
        const FEATURES_OK = 0x08;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

// =============================================================================
// VirtIO Feature Bits
// =============================================================================

/// VirtIO 1.0+ compliant device (bit 32 of the 64-bit feature space).
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
/// Negotiated ring uses event-index notification suppression (bit 29).
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
/// Negotiated ring may use indirect descriptors (bit 28).
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;

/// First bit of the reserved transport/ring feature range (inclusive).
pub const VIRTIO_TRANSPORT_F_START: u32 = 28;
/// One past the last bit of the reserved transport/ring feature range.
pub const VIRTIO_TRANSPORT_F_END: u32 = 38;

// =============================================================================
// VirtIO Queue Descriptor / Ring Flags
// =============================================================================

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// VirtIO MSI-X "no vector" sentinel.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xFFFF;

pub use crate::pci_defs::{PCI_CAP_ID_VNDR, PCI_CAP_PTR_OFFSET, PCI_STATUS_CAP_LIST, PCI_STATUS_OFFSET};

// =============================================================================
// VirtIO Common Configuration Layout (MMIO offsets)
// =============================================================================

pub const COMMON_CFG_DEVICE_FEATURE_SELECT: usize = 0x00;
pub const COMMON_CFG_DEVICE_FEATURE: usize = 0x04;
pub const COMMON_CFG_DRIVER_FEATURE_SELECT: usize = 0x08;
pub const COMMON_CFG_DRIVER_FEATURE: usize = 0x0C;
pub const COMMON_CFG_MSIX_CONFIG: usize = 0x10;
pub const COMMON_CFG_NUM_QUEUES: usize = 0x12;
pub const COMMON_CFG_DEVICE_STATUS: usize = 0x14;
pub const COMMON_CFG_CONFIG_GENERATION: usize = 0x15;
pub const COMMON_CFG_QUEUE_SELECT: usize = 0x16;
pub const COMMON_CFG_QUEUE_SIZE: usize = 0x18;
pub const COMMON_CFG_QUEUE_MSIX_VECTOR: usize = 0x1A;
pub const COMMON_CFG_QUEUE_ENABLE: usize = 0x1C;
pub const COMMON_CFG_QUEUE_NOTIFY_OFF: usize = 0x1E;
pub const COMMON_CFG_QUEUE_DESC: usize = 0x20;
pub const COMMON_CFG_QUEUE_AVAIL: usize = 0x28;
pub const COMMON_CFG_QUEUE_USED: usize = 0x30;

// =============================================================================
// VirtIO MMIO Capabilities
// =============================================================================

/// Parsed virtio PCI capabilities: MMIO regions mapped for device interaction.
#[derive(Clone, Copy, Default)]
pub struct VirtioMmioCaps {
    pub common_cfg: MmioRegion,
    /// The notify-cfg region, pre-mapped whole when it is small enough
    /// (see `cap::NOTIFY_PREMAP_MAX`). Left unmapped when the device's
    /// notify region is too large to pre-map in one piece - per-queue
    /// notify cells are then mapped individually from `notify_cap`.
    pub notify_cfg: MmioRegion,
    /// The raw, unmapped notify capability, kept so per-queue notify cells
    /// can be mapped individually when `notify_cfg` was not pre-mapped.
    pub notify_cap: Option<CapabilityInfo>,
    pub notify_off_multiplier: u32,
    pub isr_cfg: MmioRegion,
    pub device_cfg: MmioRegion,
    pub device_cfg_len: u32,
}

impl VirtioMmioCaps {
    pub const fn empty() -> Self {
        Self {
            common_cfg: MmioRegion::empty(),
            notify_cfg: MmioRegion::empty(),
            notify_cap: None,
            notify_off_multiplier: 0,
            isr_cfg: MmioRegion::empty(),
            device_cfg: MmioRegion::empty(),
            device_cfg_len: 0,
        }
    }

    #[inline]
    pub fn has_common_cfg(&self) -> bool {
        self.common_cfg.is_mapped()
    }

    #[inline]
    pub fn has_notify_cfg(&self) -> bool {
        self.notify_cfg.is_mapped()
    }

    #[inline]
    pub fn has_device_cfg(&self) -> bool {
        self.device_cfg.is_mapped()
    }
}

// =============================================================================
// Device Status Helpers
// =============================================================================

#[inline]
pub fn set_device_status(cfg: &MmioRegion, status: DeviceStatus) {
    cfg.write::<u8>(COMMON_CFG_DEVICE_STATUS, status.bits());
}

#[inline]
pub fn get_device_status(cfg: &MmioRegion) -> DeviceStatus {
    DeviceStatus::from_bits_truncate(cfg.read::<u8>(COMMON_CFG_DEVICE_STATUS))
}

// =============================================================================
// VirtIO Memory Barrier Abstractions
// =============================================================================

/// Store-store fence separating descriptor/slot writes from publishing
/// `avail.idx` (virtio spec 2.7.13.3: "A driver MUST perform a suitable
/// memory barrier before the avail.idx update").
#[inline(always)]
pub fn virtio_wmb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

/// Acquire fence separating the `used.idx` read from dereferencing the
/// used-ring slot it names.
#[inline(always)]
pub fn virtio_rmb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}

/// Full fence, used at the start of `kick_prepare` so the following read of
/// `avail_event` / `used.flags` reflects any concurrent host update.
#[inline(always)]
pub fn virtio_mb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
