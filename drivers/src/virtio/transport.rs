//! Transport Control Plane and Device-Config Accessor: everything that
//! lives in the common-cfg and device-cfg MMIO regions.

use virtio_abi::PhysAddr;

use crate::error::{VirtioError, VirtioResult};
use crate::virtio::hsi::HostServices;
use crate::virtio::mmio::MmioRegion;
use crate::virtio::{
    COMMON_CFG_CONFIG_GENERATION, COMMON_CFG_DEVICE_FEATURE, COMMON_CFG_DEVICE_FEATURE_SELECT,
    COMMON_CFG_DRIVER_FEATURE, COMMON_CFG_DRIVER_FEATURE_SELECT, COMMON_CFG_MSIX_CONFIG,
    COMMON_CFG_QUEUE_AVAIL, COMMON_CFG_QUEUE_DESC, COMMON_CFG_QUEUE_ENABLE,
    COMMON_CFG_QUEUE_MSIX_VECTOR, COMMON_CFG_QUEUE_NOTIFY_OFF, COMMON_CFG_QUEUE_SELECT,
    COMMON_CFG_QUEUE_SIZE, COMMON_CFG_QUEUE_USED, DeviceStatus, VIRTIO_F_RING_EVENT_IDX,
    VIRTIO_F_RING_INDIRECT_DESC, VIRTIO_F_VERSION_1, VIRTIO_MSI_NO_VECTOR, VIRTIO_TRANSPORT_F_END,
    VIRTIO_TRANSPORT_F_START, get_device_status, set_device_status,
};

/// Restricts the device-offered feature bitset to the transport bits this
/// core understands, passing every other bit through unmodified.
///
/// Mirrors `vring_transport_features`: of the reserved ring/transport
/// feature range, only `VERSION_1`, `RING_EVENT_IDX`, and
/// `RING_INDIRECT_DESC` survive; every other bit in that range is cleared
/// regardless of what the device offered.
pub fn transport_features(device_features: u64) -> u64 {
    let mut mask = 0u64;
    for bit in 0..64u32 {
        let in_transport_range = bit >= VIRTIO_TRANSPORT_F_START && bit < VIRTIO_TRANSPORT_F_END;
        if !in_transport_range {
            mask |= 1 << bit;
        }
    }
    mask |= VIRTIO_F_VERSION_1 | VIRTIO_F_RING_EVENT_IDX | VIRTIO_F_RING_INDIRECT_DESC;
    device_features & mask
}

/// Reads and writes the common configuration region.
pub struct TransportControlPlane<'a> {
    cfg: &'a MmioRegion,
}

impl<'a> TransportControlPlane<'a> {
    pub fn new(cfg: &'a MmioRegion) -> Self {
        Self { cfg }
    }

    pub fn get_features(&self) -> u64 {
        self.cfg.write_u32(COMMON_CFG_DEVICE_FEATURE_SELECT, 0);
        let lo = self.cfg.read_u32(COMMON_CFG_DEVICE_FEATURE) as u64;
        self.cfg.write_u32(COMMON_CFG_DEVICE_FEATURE_SELECT, 1);
        let hi = self.cfg.read_u32(COMMON_CFG_DEVICE_FEATURE) as u64;
        lo | (hi << 32)
    }

    pub fn finalize_features(&self, features: u64) -> VirtioResult {
        if features & VIRTIO_F_VERSION_1 == 0 {
            return Err(VirtioError::Invalid);
        }
        self.cfg.write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 0);
        self.cfg.write_u32(COMMON_CFG_DRIVER_FEATURE, features as u32);
        self.cfg.write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 1);
        self.cfg.write_u32(COMMON_CFG_DRIVER_FEATURE, (features >> 32) as u32);
        Ok(())
    }

    pub fn get_status(&self) -> DeviceStatus {
        get_device_status(self.cfg)
    }

    /// Set the status byte. Setting the empty set is forbidden here - use
    /// `reset`.
    pub fn set_status(&self, status: DeviceStatus) -> VirtioResult {
        if status.is_empty() {
            return Err(VirtioError::Bug);
        }
        set_device_status(self.cfg, status);
        Ok(())
    }

    /// Write status=0 and poll (via HSI `msleep`) until the device
    /// acknowledges, flushing the status write and any pending device
    /// writes including MSI-X. Idempotent: calling it again when status is
    /// already 0 returns immediately.
    pub fn reset(&self, hsi: &dyn HostServices) {
        set_device_status(self.cfg, DeviceStatus::empty());
        while !get_device_status(self.cfg).is_empty() {
            hsi.msleep(1);
        }
    }

    /// Write the config-change MSI-X vector, returning the value read back
    /// (the host may refuse and report `NO_VECTOR`).
    pub fn set_config_vector(&self, vector: u16) -> u16 {
        self.cfg.write_u16(COMMON_CFG_MSIX_CONFIG, vector);
        self.cfg.read_u16(COMMON_CFG_MSIX_CONFIG)
    }

    /// Select queue `idx` and read its size. `None` if the queue does not
    /// exist (size reads back as 0) or is not a power of two.
    pub fn query_queue(&self, idx: u16) -> VirtioResult<u16> {
        self.cfg.write_u16(COMMON_CFG_QUEUE_SELECT, idx);
        let size = self.cfg.read_u16(COMMON_CFG_QUEUE_SIZE);
        if size == 0 {
            return Err(VirtioError::NotPresent);
        }
        if !size.is_power_of_two() {
            return Err(VirtioError::Invalid);
        }
        Ok(size)
    }

    /// The per-queue notify offset (in units of `notify_off_multiplier`).
    pub fn queue_notify_off(&self, idx: u16) -> u16 {
        self.cfg.write_u16(COMMON_CFG_QUEUE_SELECT, idx);
        self.cfg.read_u16(COMMON_CFG_QUEUE_NOTIFY_OFF)
    }

    /// Program a queue's size and ring addresses, and its MSI-X vector if
    /// any. Does not enable the queue - call `enable_queue` after every
    /// queue has been programmed.
    pub fn program_queue(
        &self,
        idx: u16,
        desc_pa: PhysAddr,
        avail_pa: PhysAddr,
        used_pa: PhysAddr,
        size: u16,
        msix_vec: Option<u16>,
    ) -> VirtioResult {
        self.cfg.write_u16(COMMON_CFG_QUEUE_SELECT, idx);
        self.cfg.write_u16(COMMON_CFG_QUEUE_SIZE, size);
        write_u64_twopart(self.cfg, COMMON_CFG_QUEUE_DESC, desc_pa.as_u64());
        write_u64_twopart(self.cfg, COMMON_CFG_QUEUE_AVAIL, avail_pa.as_u64());
        write_u64_twopart(self.cfg, COMMON_CFG_QUEUE_USED, used_pa.as_u64());

        if let Some(vec) = msix_vec {
            self.cfg.write_u16(COMMON_CFG_QUEUE_MSIX_VECTOR, vec);
            let readback = self.cfg.read_u16(COMMON_CFG_QUEUE_MSIX_VECTOR);
            if vec != VIRTIO_MSI_NO_VECTOR && readback == VIRTIO_MSI_NO_VECTOR {
                return Err(VirtioError::Busy);
            }
        }

        Ok(())
    }

    /// Last step in bringing up a queue. From this point the queue cannot
    /// be reprogrammed without a full reset.
    pub fn enable_queue(&self, idx: u16) {
        self.cfg.write_u16(COMMON_CFG_QUEUE_SELECT, idx);
        self.cfg.write_u16(COMMON_CFG_QUEUE_ENABLE, 1);
    }

    /// Select queue `idx` and disable its MSI-X vector, flushing the write
    /// with a read-back when MSI-X is in use.
    pub fn delete_queue(&self, idx: u16, msix_used: bool) {
        self.cfg.write_u16(COMMON_CFG_QUEUE_SELECT, idx);
        if msix_used {
            self.cfg.write_u16(COMMON_CFG_QUEUE_MSIX_VECTOR, VIRTIO_MSI_NO_VECTOR);
            let _ = self.cfg.read_u16(COMMON_CFG_QUEUE_MSIX_VECTOR);
        }
    }

    /// ACKNOWLEDGE | DRIVER, as the first step of bring-up after reset.
    pub fn begin_driver_init(&self) {
        let status = get_device_status(self.cfg);
        set_device_status(self.cfg, status | DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);
    }

    /// Set FEATURES_OK and read it back; `Ok` iff the device accepted it.
    pub fn confirm_features_ok(&self) -> VirtioResult {
        let status = get_device_status(self.cfg);
        set_device_status(self.cfg, status | DeviceStatus::FEATURES_OK);
        if get_device_status(self.cfg).contains(DeviceStatus::FEATURES_OK) {
            Ok(())
        } else {
            Err(VirtioError::Invalid)
        }
    }
}

fn write_u64_twopart(cfg: &MmioRegion, offset: usize, value: u64) {
    cfg.write_u32(offset, value as u32);
    cfg.write_u32(offset + 4, (value >> 32) as u32);
}


/// Naturally-sized access to the device-specific configuration region, with
/// torn-read detection via the config-generation counter.
pub struct DeviceConfigAccessor<'a> {
    region: &'a MmioRegion,
    generation_cfg: &'a MmioRegion,
}

impl<'a> DeviceConfigAccessor<'a> {
    pub fn new(region: &'a MmioRegion, common_cfg: &'a MmioRegion) -> Self {
        Self { region, generation_cfg: common_cfg }
    }

    pub fn generation(&self) -> u8 {
        self.generation_cfg.read_u8(COMMON_CFG_CONFIG_GENERATION)
    }

    /// Read `len` bytes (1, 2, 4, or 8) at `offset`. An 8-byte read is two
    /// little-endian 32-bit accesses, low half first. Panics if
    /// `offset + len` falls outside the region, or `len` is not a legal
    /// width - both are driver bugs, not recoverable errors.
    pub fn read(&self, offset: usize, len: usize) -> u64 {
        assert!(self.region.is_valid_offset(offset, len), "device-config access out of bounds");
        match len {
            1 => self.region.read_u8(offset) as u64,
            2 => self.region.read_u16(offset) as u64,
            4 => self.region.read_u32(offset) as u64,
            8 => {
                let lo = self.region.read_u32(offset) as u64;
                let hi = self.region.read_u32(offset + 4) as u64;
                lo | (hi << 32)
            }
            _ => panic!("illegal device-config access width: {}", len),
        }
    }

    /// Write `len` bytes (1, 2, 4, or 8) at `offset`, same width rules as
    /// `read`.
    pub fn write(&self, offset: usize, len: usize, value: u64) {
        assert!(self.region.is_valid_offset(offset, len), "device-config access out of bounds");
        match len {
            1 => self.region.write_u8(offset, value as u8),
            2 => self.region.write_u16(offset, value as u16),
            4 => self.region.write_u32(offset, value as u32),
            8 => {
                self.region.write_u32(offset, value as u32);
                self.region.write_u32(offset + 4, (value >> 32) as u32);
            }
            _ => panic!("illegal device-config access width: {}", len),
        }
    }
}
