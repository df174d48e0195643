//! Transport Orchestrator: ties capability discovery, feature negotiation,
//! and queue bring-up into the sequence a device personality actually calls.
//!
//! Mirrors the shape of `virtio_find_vqs`/`virtio_del_vqs` in the Linux PCI
//! transport: queues are allocated and programmed as a batch, and any
//! failure partway through unwinds everything allocated so far rather than
//! leaving the device half-configured.

use alloc::vec::Vec;

use virtio_abi::VirtAddr;

use crate::error::{VirtioError, VirtioResult};
use crate::log::{DriverLog, NullLog, log_info, log_warn};
use crate::virtio::cap::CapabilityWalker;
use crate::virtio::hsi::{HostServices, MappedRegion};
use crate::virtio::mmio::MmioRegion;
use crate::virtio::queue::Virtqueue;
use crate::virtio::transport::{DeviceConfigAccessor, TransportControlPlane, transport_features};
use crate::virtio::{
    DeviceStatus, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_VERSION_1, VIRTIO_MSI_NO_VECTOR, VirtioMmioCaps,
    get_device_status, set_device_status,
};

struct QueueSlot {
    index: u16,
    vq: Virtqueue,
    ring_virt: VirtAddr,
    ring_len: usize,
    msix_vector: u16,
    /// Where to write this queue's doorbell. A sub-window of the
    /// pre-mapped `notify_cfg` when that was premapped whole, otherwise a
    /// window mapped individually for this queue alone (`notify_owned`).
    notify: MmioRegion,
    notify_owned: bool,
}

/// One virtio-1.0 function, probed and brought up.
pub struct Device<'a> {
    hsi: &'a dyn HostServices,
    log: &'a dyn DriverLog,
    caps: VirtioMmioCaps,
    negotiated: u64,
    queues: Vec<QueueSlot>,
}

/// Build a control-plane handle over a specific capability set. A free
/// function rather than a `&self` method, so the borrow it takes stays
/// scoped to the `caps` field instead of all of `Device`.
fn plane_for(caps: &VirtioMmioCaps) -> TransportControlPlane<'_> {
    TransportControlPlane::new(&caps.common_cfg)
}

impl<'a> Device<'a> {
    /// Discover the virtio-1.0 capabilities, reset the device, and negotiate
    /// features. Leaves status at ACKNOWLEDGE | DRIVER | FEATURES_OK; the
    /// caller still must bring up queues and set DRIVER_OK. Logs go to
    /// [`NullLog`]; use [`Device::probe_with_log`] to capture bring-up
    /// diagnostics.
    pub fn probe(hsi: &'a dyn HostServices, wanted_features: u64) -> VirtioResult<Self> {
        Self::probe_with_log(hsi, wanted_features, &NullLog)
    }

    pub fn probe_with_log(
        hsi: &'a dyn HostServices,
        wanted_features: u64,
        log: &'a dyn DriverLog,
    ) -> VirtioResult<Self> {
        let caps = match CapabilityWalker::new(hsi).walk_and_map() {
            Ok(caps) => caps,
            Err(e) => {
                log_warn!(log, "virtio capability walk failed: {}", e);
                return Err(e);
            }
        };
        let mut dev = Self { hsi, log, caps, negotiated: 0, queues: Vec::new() };

        let plane = plane_for(&dev.caps);
        plane.reset(hsi);
        plane.begin_driver_init();

        let offered = plane.get_features();
        let negotiated = transport_features(offered) & (wanted_features | VIRTIO_F_VERSION_1);
        if let Err(e) = plane.finalize_features(negotiated) {
            log_warn!(log, "feature negotiation rejected by device: {}", e);
            return Err(e);
        }
        if let Err(e) = plane.confirm_features_ok() {
            log_warn!(log, "device refused FEATURES_OK: {}", e);
            return Err(e);
        }

        log_info!(log, "virtio device probed, negotiated features = {:#x}", negotiated);
        dev.negotiated = negotiated;
        Ok(dev)
    }

    pub fn negotiated_features(&self) -> u64 {
        self.negotiated
    }

    pub fn device_config(&self) -> DeviceConfigAccessor<'_> {
        DeviceConfigAccessor::new(&self.caps.device_cfg, &self.caps.common_cfg)
    }

    pub fn event_idx_negotiated(&self) -> bool {
        self.negotiated & VIRTIO_F_RING_EVENT_IDX != 0
    }

    /// Map the notify cell for queue `idx`: a sub-window of the pre-mapped
    /// `notify_cfg` when the whole notify region was small enough to
    /// pre-map, otherwise a fresh mapping of just that queue's cell.
    /// Returns the mapped region and whether it was individually mapped
    /// (and so needs its own unmap on teardown).
    fn map_queue_notify(&self, plane: &TransportControlPlane<'_>, idx: u16) -> VirtioResult<(MmioRegion, bool)> {
        let off = plane.queue_notify_off(idx) as u64 * self.caps.notify_off_multiplier as u64;
        if self.caps.notify_cfg.is_mapped() {
            let region = self.caps.notify_cfg.sub_region(off as usize, 2).ok_or(VirtioError::Invalid)?;
            Ok((region, false))
        } else {
            let cap = self.caps.notify_cap.ok_or(VirtioError::NotPresent)?;
            let region = CapabilityWalker::new(self.hsi).map(&cap, off, 2, 2, 2)?;
            Ok((region, true))
        }
    }

    /// Allocate and program one queue per entry in `sizes` (index == queue
    /// number), enabling each as it's programmed and assigning it the
    /// MSI-X vector `HostServices::pci_get_msix_vector` reports for it. On
    /// any failure, every queue allocated during this call is torn down and
    /// its memory freed before returning the error - the device is left
    /// exactly as it was before the call.
    pub fn find_vqs(&mut self, sizes: &[u16]) -> VirtioResult<()> {
        let plane = plane_for(&self.caps);
        let event_idx = self.event_idx_negotiated();
        let start = self.queues.len();

        for (i, &requested) in sizes.iter().enumerate() {
            let idx = i as u16;
            let result = (|| -> VirtioResult<QueueSlot> {
                let max_size = plane.query_queue(idx)?;
                let size = if requested == 0 { max_size } else { requested.min(max_size) };
                if size == 0 || !size.is_power_of_two() {
                    return Err(VirtioError::Invalid);
                }

                let ring_len = Virtqueue::ring_bytes(size, 4096, event_idx) as usize;
                let (ring_virt, ring_phys) =
                    self.hsi.alloc_contiguous_pages(ring_len).ok_or(VirtioError::NoMemory)?;

                let vq = match Virtqueue::new(size, 4096, ring_virt, ring_phys, event_idx) {
                    Ok(vq) => vq,
                    Err(e) => {
                        unsafe { self.hsi.free_contiguous_pages(ring_virt, ring_len) };
                        return Err(e);
                    }
                };

                let raw_vector = self.hsi.pci_get_msix_vector(idx as i32);
                let msix_vector =
                    if raw_vector == VIRTIO_MSI_NO_VECTOR { None } else { Some(raw_vector) };
                if let Err(e) = plane.program_queue(
                    idx,
                    vq.desc_phys(),
                    vq.avail_phys(),
                    vq.used_phys(),
                    size,
                    msix_vector,
                ) {
                    unsafe { self.hsi.free_contiguous_pages(ring_virt, ring_len) };
                    return Err(e);
                }

                let (notify, notify_owned) = match self.map_queue_notify(&plane, idx) {
                    Ok(pair) => pair,
                    Err(e) => {
                        unsafe { self.hsi.free_contiguous_pages(ring_virt, ring_len) };
                        return Err(e);
                    }
                };

                plane.enable_queue(idx);

                Ok(QueueSlot {
                    index: idx,
                    vq,
                    ring_virt,
                    ring_len,
                    msix_vector: msix_vector.unwrap_or(VIRTIO_MSI_NO_VECTOR),
                    notify,
                    notify_owned,
                })
            })();

            match result {
                Ok(slot) => self.queues.push(slot),
                Err(e) => {
                    log_warn!(self.log, "queue {} bring-up failed: {}, unwinding", idx, e);
                    self.unwind_from(start);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn unwind_from(&mut self, start: usize) {
        let plane = plane_for(&self.caps);
        while self.queues.len() > start {
            let slot = self.queues.pop().expect("len checked above");
            plane.delete_queue(slot.index, slot.msix_vector != VIRTIO_MSI_NO_VECTOR);
            if slot.notify_owned {
                let region = MappedRegion {
                    virt_base: slot.notify.virt_base(),
                    phys_base: slot.notify.phys_base(),
                    size: slot.notify.size(),
                };
                unsafe { self.hsi.unmap_bar_region(region) };
            }
            unsafe { self.hsi.free_contiguous_pages(slot.ring_virt, slot.ring_len) };
        }
    }

    /// Ring the doorbell for queue `idx` if the ring state since the last
    /// kick requires it (see `Virtqueue::kick_prepare`).
    pub fn kick(&mut self, idx: u16) -> VirtioResult<()> {
        let slot = self.queues.iter_mut().find(|s| s.index == idx).ok_or(VirtioError::NotPresent)?;
        if slot.vq.kick_prepare() {
            slot.notify.write_u16(0, idx);
        }
        Ok(())
    }

    /// Tear down every queue: delete from the device side and free the
    /// backing memory. Leaves device status untouched.
    pub fn del_vqs(&mut self) {
        self.unwind_from(0);
    }

    pub fn queue_mut(&mut self, idx: u16) -> Option<&mut Virtqueue> {
        self.queues.iter_mut().find(|s| s.index == idx).map(|s| &mut s.vq)
    }

    pub fn set_driver_ok(&self) {
        let status = get_device_status(&self.caps.common_cfg);
        set_device_status(&self.caps.common_cfg, status | DeviceStatus::DRIVER_OK);
    }

    pub fn set_failed(&self) {
        log_warn!(self.log, "marking virtio device FAILED");
        let status = get_device_status(&self.caps.common_cfg);
        set_device_status(&self.caps.common_cfg, status | DeviceStatus::FAILED);
    }

    /// Full device reset: tears down every queue and returns status to 0.
    /// After this call the device must be probed again before use.
    pub fn reset(&mut self) {
        log_info!(self.log, "resetting virtio device");
        self.del_vqs();
        plane_for(&self.caps).reset(self.hsi);
        self.negotiated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtio_abi::PhysAddr;

    use crate::virtio::queue::Chunk;
    use crate::virtio::testkit::{FakeDevice, build_virtio_pci_config};
    use crate::virtio::{
        COMMON_CFG_DEVICE_FEATURE, COMMON_CFG_DEVICE_STATUS, COMMON_CFG_QUEUE_SIZE,
        VIRTIO_PCI_CAP_COMMON_CFG, VIRTIO_PCI_CAP_ISR_CFG, VIRTIO_PCI_CAP_NOTIFY_CFG,
    };

    fn fake_device_with_one_queue() -> FakeDevice {
        let config = build_virtio_pci_config(
            &[
                (VIRTIO_PCI_CAP_COMMON_CFG, 0, 0x38),
                (VIRTIO_PCI_CAP_NOTIFY_CFG, 0x40, 4),
                (VIRTIO_PCI_CAP_ISR_CFG, 0x48, 1),
            ],
            4,
        );
        let fake = FakeDevice::new(config, 0x100);
        // Bit 0 of the (select-blind) feature word, mirrored into both the
        // low and high 32-bit halves the control plane reads, which is
        // enough to make the device appear VIRTIO_F_VERSION_1-capable.
        fake.seed_bar0(COMMON_CFG_DEVICE_FEATURE, &1u32.to_le_bytes());
        fake.seed_bar0(COMMON_CFG_QUEUE_SIZE, &4u16.to_le_bytes());
        fake
    }

    #[test]
    fn probe_negotiates_version_1_and_brings_up_a_queue() {
        let fake = fake_device_with_one_queue();

        let mut dev = Device::probe(&fake, VIRTIO_F_VERSION_1).expect("probe should succeed");
        assert_eq!(dev.negotiated_features() & VIRTIO_F_VERSION_1, VIRTIO_F_VERSION_1);

        dev.find_vqs(&[0]).expect("queue bring-up should succeed");

        dev.set_driver_ok();
        let status = DeviceStatus::from_bits_truncate(fake.bar0_bytes()[COMMON_CFG_DEVICE_STATUS]);
        assert!(status.contains(DeviceStatus::DRIVER_OK));
    }

    #[test]
    fn probe_fails_when_device_does_not_offer_version_1() {
        let config = build_virtio_pci_config(
            &[
                (VIRTIO_PCI_CAP_COMMON_CFG, 0, 0x38),
                (VIRTIO_PCI_CAP_NOTIFY_CFG, 0x40, 4),
                (VIRTIO_PCI_CAP_ISR_CFG, 0x48, 1),
            ],
            4,
        );
        let fake = FakeDevice::new(config, 0x100);

        let err = Device::probe(&fake, VIRTIO_F_VERSION_1).expect_err("device offers nothing");
        assert!(matches!(err, VirtioError::Invalid));
    }

    #[test]
    fn reset_clears_status_and_drops_queues() {
        let fake = fake_device_with_one_queue();
        let mut dev = Device::probe(&fake, VIRTIO_F_VERSION_1).expect("probe should succeed");
        dev.find_vqs(&[0]).expect("queue bring-up should succeed");
        dev.set_driver_ok();

        dev.reset();
        assert_eq!(fake.bar0_bytes()[COMMON_CFG_DEVICE_STATUS], 0);
        assert_eq!(dev.negotiated_features(), 0);
        assert!(dev.queue_mut(0).is_none());

        // Idempotent: resetting an already-reset device returns immediately.
        dev.reset();
        assert_eq!(fake.bar0_bytes()[COMMON_CFG_DEVICE_STATUS], 0);
    }

    #[test]
    fn kick_writes_the_notify_cell_when_the_device_wants_a_doorbell() {
        let fake = fake_device_with_one_queue();
        let mut dev = Device::probe(&fake, VIRTIO_F_VERSION_1).expect("probe should succeed");
        dev.find_vqs(&[0]).expect("queue bring-up should succeed");

        dev.queue_mut(0)
            .unwrap()
            .add_buf(&[Chunk::new(PhysAddr::new(0x1000), 4)], &[], 1, None)
            .unwrap();
        dev.kick(0).expect("kick should succeed through the pre-mapped notify cell");

        assert!(matches!(dev.kick(7), Err(VirtioError::NotPresent)));
    }

    #[test]
    fn notify_region_too_large_to_premap_is_mapped_per_queue() {
        let config = build_virtio_pci_config(
            &[
                (VIRTIO_PCI_CAP_COMMON_CFG, 0, 0x38),
                (VIRTIO_PCI_CAP_NOTIFY_CFG, 0x2000, 0x2000),
                (VIRTIO_PCI_CAP_ISR_CFG, 0x4100, 1),
            ],
            4,
        );
        let fake = FakeDevice::new(config, 0x4200);
        fake.seed_bar0(COMMON_CFG_DEVICE_FEATURE, &1u32.to_le_bytes());
        fake.seed_bar0(COMMON_CFG_QUEUE_SIZE, &4u16.to_le_bytes());

        let mut dev = Device::probe(&fake, VIRTIO_F_VERSION_1).expect("probe should succeed");
        dev.find_vqs(&[0]).expect("per-queue notify mapping should succeed");

        dev.queue_mut(0)
            .unwrap()
            .add_buf(&[Chunk::new(PhysAddr::new(0x1000), 4)], &[], 1, None)
            .unwrap();
        dev.kick(0).expect("kick should succeed through the individually-mapped notify cell");
    }
}
