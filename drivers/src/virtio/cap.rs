//! Capability Walker: scans the PCI vendor-specific capability chain for the
//! four virtio-1.0 structures (common, notify, isr, device) and maps them
//! through the Host Services Interface.

use crate::error::{VirtioError, VirtioResult};
use crate::pci_defs::{PCI_CAP_ID_VNDR, PCI_CAP_PTR_OFFSET, PCI_MAX_BARS, PCI_STATUS_CAP_LIST, PCI_STATUS_OFFSET};
use crate::virtio::hsi::{HostServices, MappedRegion};
use crate::virtio::mmio::MmioRegion;
use crate::virtio::{
    VIRTIO_PCI_CAP_COMMON_CFG, VIRTIO_PCI_CAP_DEVICE_CFG, VIRTIO_PCI_CAP_ISR_CFG,
    VIRTIO_PCI_CAP_NOTIFY_CFG, VirtioMmioCaps,
};

/// A vendor-specific virtio capability located in PCI config space, before
/// it has been mapped.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityInfo {
    pub bar: u8,
    pub offset: u64,
    pub length: u64,
    /// PCI config-space offset of this capability's own header, needed to
    /// reach fields that trail the common virtio cap layout (e.g. the
    /// notify capability's `notify_off_multiplier`).
    pub cap_ptr: u8,
}

/// Walks the capability chain of one PCI function.
pub struct CapabilityWalker<'a> {
    hsi: &'a dyn HostServices,
}

impl<'a> CapabilityWalker<'a> {
    pub fn new(hsi: &'a dyn HostServices) -> Self {
        Self { hsi }
    }

    fn read8(&self, offset: u16) -> u8 {
        self.hsi.pci_config_read(offset, 1) as u8
    }

    fn read32(&self, offset: u16) -> u32 {
        self.hsi.pci_config_read(offset, 4)
    }

    /// Find the first vendor-specific capability of `cfg_type`.
    ///
    /// Rejects entries whose BAR index is out of range (> 5). Walks at most
    /// 48 links as a guard against a malformed or cyclic capability list.
    pub fn find(&self, cfg_type: u8) -> Option<CapabilityInfo> {
        let status = self.hsi.pci_config_read(PCI_STATUS_OFFSET, 2) as u16;
        if status & PCI_STATUS_CAP_LIST == 0 {
            return None;
        }

        let mut cap_ptr = self.read8(PCI_CAP_PTR_OFFSET);
        let mut guard = 0u8;

        while cap_ptr != 0 && guard < 48 {
            guard += 1;

            let cap_id = self.read8(cap_ptr as u16);
            let cap_next = self.read8(cap_ptr as u16 + 1);
            let cap_len = self.read8(cap_ptr as u16 + 2);

            if cap_id == PCI_CAP_ID_VNDR && cap_len >= 16 {
                let found_type = self.read8(cap_ptr as u16 + 3);
                let bar = self.read8(cap_ptr as u16 + 4);
                let offset = self.read32(cap_ptr as u16 + 8) as u64;
                let length = self.read32(cap_ptr as u16 + 12) as u64;

                if found_type == cfg_type && (bar as usize) < PCI_MAX_BARS {
                    if let Some(bar_info) = self.hsi.pci_bar_info(bar) {
                        if bar_info.len != 0 && (bar_info.is_memory || bar_info.is_io) {
                            return Some(CapabilityInfo {
                                bar,
                                offset,
                                length,
                                cap_ptr,
                            });
                        }
                    }
                }
            }

            cap_ptr = cap_next;
        }

        None
    }

    /// The `notify_off_multiplier` field that trails the notify capability's
    /// common header (cap offset + 16).
    pub fn notify_off_multiplier(&self, notify: &CapabilityInfo) -> u32 {
        self.read32(notify.cap_ptr as u16 + 16)
    }

    /// Validate and map a capability's BAR window.
    ///
    /// `window_start`/`window_size` let the caller map a sub-range of the
    /// capability (used to map one queue's notify cell individually when
    /// the whole notify region is too large to pre-map in one piece).
    pub fn map(
        &self,
        cap: &CapabilityInfo,
        window_start: u64,
        min_len: u64,
        alignment: u64,
        window_size: u64,
    ) -> VirtioResult<MmioRegion> {
        if cap.length <= window_start {
            return Err(VirtioError::Invalid);
        }
        if cap.length - window_start < min_len {
            return Err(VirtioError::Invalid);
        }
        let base_offset = window_start
            .checked_add(cap.offset)
            .ok_or(VirtioError::Invalid)?;
        if alignment != 0 && base_offset % alignment != 0 {
            return Err(VirtioError::Invalid);
        }

        let bar_info = self.hsi.pci_bar_info(cap.bar).ok_or(VirtioError::Invalid)?;
        let mapped_len = (cap.length - window_start).min(window_size);
        let end = base_offset.checked_add(mapped_len).ok_or(VirtioError::Invalid)?;
        if end > bar_info.len {
            return Err(VirtioError::Invalid);
        }

        let region = self
            .hsi
            .map_bar_region(cap.bar, base_offset, mapped_len as usize)
            .ok_or(VirtioError::NoMemory)?;

        Ok(MmioRegion::from_mapped(region))
    }

    /// Locate and map all four virtio-1.0 structures, as done during probe.
    ///
    /// Absence of a common-cfg capability is reported distinctly (callers
    /// may fall back to legacy virtio); absence of isr-cfg or notify-cfg
    /// given common-cfg is present is a hard error. Device-cfg is optional.
    ///
    /// The notify-cfg region is pre-mapped whole only while it is no larger
    /// than [`NOTIFY_PREMAP_MAX`] - some devices back it with one cell per
    /// queue and size it far past what's worth holding mapped all at once.
    /// Past that threshold `notify_cfg` is left unmapped and the raw
    /// capability is kept in `notify_cap` so the orchestrator can map each
    /// queue's notify cell individually during bring-up.
    pub fn walk_and_map(&self) -> VirtioResult<VirtioMmioCaps> {
        let common = self.find(VIRTIO_PCI_CAP_COMMON_CFG).ok_or(VirtioError::NotPresent)?;
        let notify = self.find(VIRTIO_PCI_CAP_NOTIFY_CFG).ok_or(VirtioError::Invalid)?;
        let isr = self.find(VIRTIO_PCI_CAP_ISR_CFG).ok_or(VirtioError::Invalid)?;
        let device = self.find(VIRTIO_PCI_CAP_DEVICE_CFG);

        let mut caps = VirtioMmioCaps::empty();

        caps.common_cfg = self.map(&common, 0, common.length, 4, common.length)?;
        caps.isr_cfg = self.map(&isr, 0, 1, 1, isr.length)?;
        caps.notify_off_multiplier = self.notify_off_multiplier(&notify);
        if notify.length <= NOTIFY_PREMAP_MAX {
            caps.notify_cfg = self.map(&notify, 0, notify.length, 2, notify.length)?;
        }
        caps.notify_cap = Some(notify);

        if let Some(device) = device {
            caps.device_cfg = self.map(&device, 0, 1, 1, device.length)?;
            caps.device_cfg_len = device.length as u32;
        }

        Ok(caps)
    }
}

/// Largest notify-cfg region this crate will pre-map as a whole during
/// probe. Devices with a notify cell per queue can size this region well
/// past one page; beyond this limit, per-queue cells are mapped
/// individually from `VirtioMmioCaps::notify_cap` during `find_vqs` instead.
pub const NOTIFY_PREMAP_MAX: u64 = 4096;
