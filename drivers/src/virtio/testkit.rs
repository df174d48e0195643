//! Host-side fake [`HostServices`], backed by heap memory instead of real
//! PCI config space and BARs. Lets the transport/orchestrator logic run as
//! ordinary host `#[test]`s without a kernel or a device behind it.

extern crate std;

use alloc::vec;
use core::cell::RefCell;
use std::vec::Vec as StdVec;

use virtio_abi::{PhysAddr, VirtAddr};

use crate::virtio::hsi::{BarInfo, HostServices, MappedRegion, NO_VECTOR};

/// A fake PCI function: a byte-addressable "config space" and one backing
/// buffer standing in for a memory BAR.
pub struct FakeDevice {
    config: RefCell<StdVec<u8>>,
    bar0: RefCell<StdVec<u8>>,
    msix_vector: RefCell<u16>,
}

impl FakeDevice {
    pub fn new(config: StdVec<u8>, bar0_len: usize) -> Self {
        Self {
            config: RefCell::new(config),
            bar0: RefCell::new(std::vec![0u8; bar0_len]),
            msix_vector: RefCell::new(NO_VECTOR),
        }
    }

    /// Direct access to BAR0 bytes, for tests to inspect what the common-cfg
    /// writer actually wrote.
    pub fn bar0_bytes(&self) -> StdVec<u8> {
        self.bar0.borrow().clone()
    }

    /// Seed BAR0 bytes at `offset`, for tests to stand in for device-side
    /// state a real common-cfg region would already report (e.g. a queue's
    /// maximum size) before the transport reads it.
    pub fn seed_bar0(&self, offset: usize, bytes: &[u8]) {
        let mut bar = self.bar0.borrow_mut();
        bar[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_msix_vector(&self, vector: u16) {
        *self.msix_vector.borrow_mut() = vector;
    }
}

impl HostServices for FakeDevice {
    fn alloc_contiguous_pages(&self, len: usize) -> Option<(VirtAddr, PhysAddr)> {
        let mut buf: StdVec<u8> = vec![0u8; len];
        let addr = buf.as_mut_ptr() as u64;
        core::mem::forget(buf);
        Some((VirtAddr::new(addr), PhysAddr::new(addr)))
    }

    unsafe fn free_contiguous_pages(&self, virt: VirtAddr, len: usize) {
        unsafe {
            let _ = StdVec::from_raw_parts(virt.as_u64() as *mut u8, len, len);
        }
    }

    fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(virt.as_u64()))
    }

    fn kmalloc(&self, len: usize) -> Option<VirtAddr> {
        let mut buf: StdVec<u8> = vec![0u8; len];
        let addr = buf.as_mut_ptr() as u64;
        core::mem::forget(buf);
        Some(VirtAddr::new(addr))
    }

    unsafe fn kfree(&self, virt: VirtAddr) {
        let _ = virt;
    }

    fn pci_config_read(&self, offset: u16, width: u8) -> u32 {
        let config = self.config.borrow();
        let offset = offset as usize;
        match width {
            1 => config.get(offset).copied().unwrap_or(0) as u32,
            2 => {
                let b0 = config.get(offset).copied().unwrap_or(0) as u32;
                let b1 = config.get(offset + 1).copied().unwrap_or(0) as u32;
                b0 | (b1 << 8)
            }
            4 => {
                let mut v = 0u32;
                for i in 0..4 {
                    v |= (config.get(offset + i).copied().unwrap_or(0) as u32) << (8 * i);
                }
                v
            }
            _ => 0,
        }
    }

    fn pci_config_write(&self, offset: u16, width: u8, value: u32) {
        let mut config = self.config.borrow_mut();
        let offset = offset as usize;
        let needed = offset + width as usize;
        if config.len() < needed {
            config.resize(needed, 0);
        }
        for i in 0..width as usize {
            config[offset + i] = ((value >> (8 * i)) & 0xFF) as u8;
        }
    }

    fn pci_bar_info(&self, index: u8) -> Option<BarInfo> {
        if index == 0 {
            Some(BarInfo { len: self.bar0.borrow().len() as u64, is_io: false, is_memory: true })
        } else {
            None
        }
    }

    fn map_bar_region(&self, index: u8, offset: u64, len: usize) -> Option<MappedRegion> {
        if index != 0 {
            return None;
        }
        let bar = self.bar0.borrow();
        if offset as usize + len > bar.len() {
            return None;
        }
        let base = bar.as_ptr() as u64 + offset;
        Some(MappedRegion { virt_base: VirtAddr::new(base), phys_base: PhysAddr::new(base), size: len })
    }

    unsafe fn unmap_bar_region(&self, _region: MappedRegion) {}

    fn pci_get_msix_vector(&self, _queue_index: i32) -> u16 {
        *self.msix_vector.borrow()
    }

    fn msleep(&self, _millis: u32) {}
}

/// Lay out a minimal but complete virtio-1.0 PCI capability chain: status
/// register with the capability-list bit set, a capabilities pointer, and
/// one vendor-specific entry per `(cfg_type, bar_offset, length)`, all
/// pointing at BAR 0. Each entry after the common-cfg one also carries a
/// trailing `notify_off_multiplier`-shaped field so the notify capability
/// can be found at a fixed +16 offset regardless of position in the chain.
pub fn build_virtio_pci_config(regions: &[(u8, u64, u64)], notify_off_multiplier: u32) -> StdVec<u8> {
    const PCI_STATUS_OFFSET: usize = 0x06;
    const PCI_CAP_PTR_OFFSET: usize = 0x34;
    const PCI_STATUS_CAP_LIST: u16 = 0x10;
    const PCI_CAP_ID_VNDR: u8 = 0x09;
    const FIRST_CAP_OFFSET: usize = 0x40;
    const CAP_ENTRY_LEN: usize = 20;

    let mut config: StdVec<u8> = std::vec![0u8; FIRST_CAP_OFFSET + regions.len() * CAP_ENTRY_LEN];

    let status = PCI_STATUS_CAP_LIST;
    config[PCI_STATUS_OFFSET] = (status & 0xFF) as u8;
    config[PCI_STATUS_OFFSET + 1] = (status >> 8) as u8;
    config[PCI_CAP_PTR_OFFSET] = FIRST_CAP_OFFSET as u8;

    for (i, &(cfg_type, bar_offset, length)) in regions.iter().enumerate() {
        let cap_ptr = FIRST_CAP_OFFSET + i * CAP_ENTRY_LEN;
        let next = if i + 1 < regions.len() { (cap_ptr + CAP_ENTRY_LEN) as u8 } else { 0 };

        config[cap_ptr] = PCI_CAP_ID_VNDR;
        config[cap_ptr + 1] = next;
        config[cap_ptr + 2] = 16; // cap_len
        config[cap_ptr + 3] = cfg_type;
        config[cap_ptr + 4] = 0; // bar
        config[cap_ptr + 8..cap_ptr + 12].copy_from_slice(&(bar_offset as u32).to_le_bytes());
        config[cap_ptr + 12..cap_ptr + 16].copy_from_slice(&(length as u32).to_le_bytes());
        config[cap_ptr + 16..cap_ptr + 20].copy_from_slice(&notify_off_multiplier.to_le_bytes());
    }

    config
}
