//! Host Services Interface: the narrow boundary between the transport core
//! and the kernel glue that owns PCI config space, DMA memory, and
//! interrupt routing.
//!
//! The core never touches port I/O, page tables, or MSI-X tables directly;
//! it calls through an `&dyn HostServices` object supplied at construction,
//! so it can be exercised on the host with a fake (see `testkit`) instead
//! of real hardware.

use virtio_abi::{PhysAddr, VirtAddr};

/// Sentinel returned by `pci_get_msix_vector` when a queue has no vector.
pub const NO_VECTOR: u16 = 0xFFFF;

/// A mapped BAR region, or a window into one.
///
/// Owned for the lifetime of the device; the core reads and writes through
/// it with naturally-sized volatile accesses but never unmaps it itself -
/// `unmap_bar` is called explicitly during teardown.
#[derive(Clone, Copy, Debug)]
pub struct MappedRegion {
    pub virt_base: VirtAddr,
    pub phys_base: PhysAddr,
    pub size: usize,
}

/// Resource-type flags reported for a BAR, as laid out in PCI config space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarInfo {
    pub len: u64,
    pub is_io: bool,
    pub is_memory: bool,
}

/// The set of host-provided operations the transport core calls.
///
/// Every method is a capability, not a policy: the core asks for resources
/// and reports failures through `VirtioResult`, it never decides placement
/// or retries on its own behalf beyond what the spec requires (e.g. the
/// `reset()` poll loop, which calls `msleep` through this trait).
pub trait HostServices {
    /// Allocate `len` bytes of zeroed, physically contiguous, DMA-capable
    /// memory. Returns `None` on allocation failure.
    fn alloc_contiguous_pages(&self, len: usize) -> Option<(VirtAddr, PhysAddr)>;

    /// Free memory previously returned by `alloc_contiguous_pages`.
    ///
    /// # Safety
    /// `virt` and `len` must match a prior allocation exactly.
    unsafe fn free_contiguous_pages(&self, virt: VirtAddr, len: usize);

    /// Translate a virtual pointer returned by `alloc_contiguous_pages` (or
    /// a sub-pointer of one) to its guest-physical address.
    fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr>;

    /// Allocate a small non-DMA object of `len` bytes.
    fn kmalloc(&self, len: usize) -> Option<VirtAddr>;

    /// Free an object returned by `kmalloc`.
    ///
    /// # Safety
    /// `virt` must have been returned by `kmalloc` and not freed already.
    unsafe fn kfree(&self, virt: VirtAddr);

    /// Read `width` bytes (1, 2, or 4) from PCI config space at `offset`.
    fn pci_config_read(&self, offset: u16, width: u8) -> u32;

    /// Write `width` bytes (1, 2, or 4) to PCI config space at `offset`.
    fn pci_config_write(&self, offset: u16, width: u8, value: u32);

    /// Query the length and resource-type flags of BAR `index`.
    fn pci_bar_info(&self, index: u8) -> Option<BarInfo>;

    /// Map `len` bytes of BAR `index` starting at `offset` into the
    /// driver's address space.
    fn map_bar_region(&self, index: u8, offset: u64, len: usize) -> Option<MappedRegion>;

    /// Unmap a region previously returned by `map_bar_region`.
    ///
    /// # Safety
    /// `region` must have been returned by `map_bar_region` and not
    /// unmapped already.
    unsafe fn unmap_bar_region(&self, region: MappedRegion);

    /// The MSI-X vector assigned to `queue_index`, or `NO_VECTOR`.
    /// `queue_index = -1` asks for the config-change vector.
    fn pci_get_msix_vector(&self, queue_index: i32) -> u16;

    /// Sleep for approximately `millis` milliseconds. May busy-wait.
    fn msleep(&self, millis: u32);
}
