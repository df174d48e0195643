//! Split-ring virtqueue engine: the shared-memory SPSC protocol between the
//! guest driver and the host device.
//!
//! A queue is a single contiguous, zeroed, physically-contiguous allocation
//! holding the descriptor table, the avail ring, and the used ring, laid
//! out per the standard virtio split-ring layout. This type only knows how
//! to drive that protocol; it does not allocate the backing memory or talk
//! to PCI - both are the orchestrator's and HSI's job.

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::{read_volatile, write_bytes, write_volatile};

use virtio_abi::{PhysAddr, VirtAddr};

use crate::error::{VirtioError, VirtioResult};
use crate::virtio::{
    VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
    VIRTQ_USED_F_NO_NOTIFY, virtio_mb, virtio_rmb, virtio_wmb,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One scatter/gather element of a submit: a guest-physical buffer address
/// and its length. Direction (out vs in) is implied by position in the
/// `out`/`in_` slices passed to [`Virtqueue::add_buf`].
#[derive(Clone, Copy, Debug)]
pub struct Chunk {
    pub addr: PhysAddr,
    pub len: u32,
}

impl Chunk {
    pub fn new(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len }
    }
}

/// A pre-allocated indirect descriptor page: its virtual address (for the
/// engine to write descriptors into) and its physical address (for the
/// main descriptor table to reference).
#[derive(Clone, Copy, Debug)]
pub struct IndirectPage {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
}

struct QueueLayout {
    desc_off: u64,
    avail_off: u64,
    used_off: u64,
    total_size: u64,
}

impl QueueLayout {
    fn compute(num: u16, align: u64, event_idx: bool) -> Self {
        let num = num as u64;
        let desc_off = 0u64;
        let desc_size = num * size_of::<VirtqDesc>() as u64;

        let avail_off = desc_off + desc_size;
        let event_word = if event_idx { 2 } else { 0 };
        let avail_size = 4 + num * 2 + event_word;

        let used_off = align_up(avail_off + avail_size, align.max(1));
        let used_size = 4 + num * 8 + event_word;

        Self {
            desc_off,
            avail_off,
            used_off,
            total_size: used_off + used_size,
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// `vring_need_event(event_idx, new, old)`: true iff `event_idx` lies in the
/// half-open 16-bit interval `(old, new]`.
#[inline]
pub fn vring_need_event(event_idx: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event_idx).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

/// A constructed split-ring virtqueue over guest-owned DMA memory.
pub struct Virtqueue {
    num: u16,
    align: u64,
    event_idx: bool,
    ring_virt: VirtAddr,
    ring_phys: PhysAddr,
    desc_off: u64,
    avail_off: u64,
    used_off: u64,

    opaque: Vec<Option<u64>>,
    first_free: u16,
    num_free: u16,
    num_added: u16,
    last_used: u16,
    shadow_avail_flags: u16,
    shadow_avail_idx: u16,
}

impl Virtqueue {
    /// Construct a new engine over `ring_virt`/`ring_phys`, a contiguous
    /// allocation of at least `Virtqueue::ring_bytes(num, align, event_idx)`
    /// bytes. `num` must be a power of two.
    pub fn new(
        num: u16,
        align: u64,
        ring_virt: VirtAddr,
        ring_phys: PhysAddr,
        event_idx: bool,
    ) -> VirtioResult<Self> {
        if num == 0 || !num.is_power_of_two() {
            return Err(VirtioError::Invalid);
        }

        let layout = QueueLayout::compute(num, align, event_idx);

        let mut vq = Self {
            num,
            align,
            event_idx,
            ring_virt,
            ring_phys,
            desc_off: layout.desc_off,
            avail_off: layout.avail_off,
            used_off: layout.used_off,
            opaque: vec![None; num as usize],
            first_free: 0,
            num_free: num,
            num_added: 0,
            last_used: 0,
            shadow_avail_flags: 0,
            shadow_avail_idx: 0,
        };

        unsafe {
            write_bytes(vq.ring_virt.as_u64() as *mut u8, 0, layout.total_size as usize);
        }
        vq.reinit_free_list();
        Ok(vq)
    }

    /// Number of bytes the backing allocation must provide.
    pub fn ring_bytes(num: u16, align: u64, event_idx: bool) -> u64 {
        QueueLayout::compute(num, align, event_idx).total_size
    }

    pub fn capacity(&self) -> u16 {
        self.num
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn desc_phys(&self) -> PhysAddr {
        PhysAddr::new(self.ring_phys.as_u64() + self.desc_off)
    }

    pub fn avail_phys(&self) -> PhysAddr {
        PhysAddr::new(self.ring_phys.as_u64() + self.avail_off)
    }

    pub fn used_phys(&self) -> PhysAddr {
        PhysAddr::new(self.ring_phys.as_u64() + self.used_off)
    }

    fn reinit_free_list(&mut self) {
        for i in 0..self.num.saturating_sub(1) {
            self.write_desc(i, 0, 0, VIRTQ_DESC_F_NEXT, i + 1);
        }
        for slot in self.opaque.iter_mut() {
            *slot = None;
        }
        self.first_free = 0;
        self.num_free = self.num;
        self.num_added = 0;
        self.last_used = 0;
        self.shadow_avail_flags = 0;
        self.shadow_avail_idx = 0;
        self.write_avail_flags(0);
        self.write_avail_idx(0);
        self.write_used_flags(0);
    }

    // -- raw ring accessors -------------------------------------------------

    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        debug_assert!(idx < self.num);
        (self.ring_virt.as_u64() + self.desc_off + idx as u64 * size_of::<VirtqDesc>() as u64)
            as *mut VirtqDesc
    }

    fn read_desc(&self, idx: u16) -> VirtqDesc {
        unsafe { read_volatile(self.desc_ptr(idx)) }
    }

    fn write_desc(&self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        unsafe {
            write_volatile(self.desc_ptr(idx), VirtqDesc { addr, len, flags, next });
        }
    }

    fn write_indirect_desc(&self, page: VirtAddr, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let ptr = (page.as_u64() + idx as u64 * size_of::<VirtqDesc>() as u64) as *mut VirtqDesc;
        unsafe {
            write_volatile(ptr, VirtqDesc { addr, len, flags, next });
        }
    }

    fn avail_flags_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.avail_off) as *mut u16
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.avail_off + 2) as *mut u16
    }

    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        (self.ring_virt.as_u64() + self.avail_off + 4 + slot as u64 * 2) as *mut u16
    }

    fn avail_used_event_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.avail_off + 4 + self.num as u64 * 2) as *mut u16
    }

    fn used_flags_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.used_off) as *mut u16
    }

    fn used_idx_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.used_off + 2) as *mut u16
    }

    fn used_ring_ptr(&self, slot: u16) -> *mut (u32, u32) {
        (self.ring_virt.as_u64() + self.used_off + 4 + slot as u64 * 8) as *mut (u32, u32)
    }

    fn used_avail_event_ptr(&self) -> *mut u16 {
        (self.ring_virt.as_u64() + self.used_off + 4 + self.num as u64 * 8) as *mut u16
    }

    fn write_avail_flags(&self, flags: u16) {
        unsafe { write_volatile(self.avail_flags_ptr(), flags) }
    }

    fn write_avail_idx(&self, idx: u16) {
        unsafe { write_volatile(self.avail_idx_ptr(), idx) }
    }

    fn write_avail_ring_slot(&self, slot: u16, head: u16) {
        unsafe { write_volatile(self.avail_ring_ptr(slot), head) }
    }

    fn write_avail_used_event(&self, value: u16) {
        if self.event_idx {
            unsafe { write_volatile(self.avail_used_event_ptr(), value) }
        }
    }

    fn read_used_idx(&self) -> u16 {
        unsafe { read_volatile(self.used_idx_ptr()) }
    }

    fn read_used_flags(&self) -> u16 {
        unsafe { read_volatile(self.used_flags_ptr()) }
    }

    fn read_used_elem(&self, slot: u16) -> (u32, u32) {
        unsafe { read_volatile(self.used_ring_ptr(slot)) }
    }

    fn write_used_flags(&self, flags: u16) {
        unsafe { write_volatile(self.used_flags_ptr(), flags) }
    }

    fn read_used_avail_event(&self) -> u16 {
        if self.event_idx {
            unsafe { read_volatile(self.used_avail_event_ptr()) }
        } else {
            0
        }
    }

    fn pop_free(&mut self) -> u16 {
        let idx = self.first_free;
        let desc = self.read_desc(idx);
        self.first_free = desc.next;
        idx
    }

    /// Whether interrupts are currently enabled on this queue (NO_INTERRUPT
    /// clear in the driver-private shadow flags).
    pub fn interrupts_enabled(&self) -> bool {
        self.shadow_avail_flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0
    }

    /// Submit a scatter/gather request: `out` elements (driver-readable,
    /// written by the guest) followed by `in_` elements (driver-writable,
    /// filled in by the host). `token` is returned by a later `get_buf`.
    ///
    /// Uses an indirect descriptor when `indirect` is supplied, the total
    /// element count exceeds one, and at least one descriptor is free;
    /// otherwise submits directly and fails with `NoSpace` if there are not
    /// enough free descriptors (no state is changed on failure).
    pub fn add_buf(
        &mut self,
        out: &[Chunk],
        in_: &[Chunk],
        token: u64,
        indirect: Option<IndirectPage>,
    ) -> VirtioResult<()> {
        let out_n = out.len();
        let in_n = in_.len();
        let total = out_n + in_n;
        if total == 0 {
            return Err(VirtioError::Invalid);
        }

        let use_indirect = indirect.is_some() && total > 1 && self.num_free > 0;

        let head = if use_indirect {
            let page = indirect.expect("checked above");
            for i in 0..total {
                let chunk = if i < out_n { out[i] } else { in_[i - out_n] };
                let is_last = i + 1 == total;
                let mut flags = 0u16;
                if !is_last {
                    flags |= VIRTQ_DESC_F_NEXT;
                }
                if i >= out_n {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                let next = if is_last { 0 } else { (i + 1) as u16 };
                self.write_indirect_desc(page.virt, i as u16, chunk.addr.as_u64(), chunk.len, flags, next);
            }
            let head = self.pop_free();
            let desc_len = (total * size_of::<VirtqDesc>()) as u32;
            self.write_desc(head, page.phys.as_u64(), desc_len, VIRTQ_DESC_F_INDIRECT, 0);
            self.opaque[head as usize] = Some(token);
            self.num_free -= 1;
            head
        } else {
            if total > self.num_free as usize {
                return Err(VirtioError::NoSpace);
            }

            let mut indices = Vec::with_capacity(total);
            for _ in 0..total {
                indices.push(self.pop_free());
            }

            for i in 0..total {
                let chunk = if i < out_n { out[i] } else { in_[i - out_n] };
                let is_last = i + 1 == total;
                let mut flags = 0u16;
                if !is_last {
                    flags |= VIRTQ_DESC_F_NEXT;
                }
                if i >= out_n {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                let next = if is_last { 0 } else { indices[i + 1] };
                self.write_desc(indices[i], chunk.addr.as_u64(), chunk.len, flags, next);
            }

            let head = indices[0];
            self.opaque[head as usize] = Some(token);
            self.num_free -= total as u16;
            head
        };

        let slot = self.shadow_avail_idx % self.num;
        self.write_avail_ring_slot(slot, head);
        virtio_wmb();
        self.shadow_avail_idx = self.shadow_avail_idx.wrapping_add(1);
        self.write_avail_idx(self.shadow_avail_idx);
        self.num_added = self.num_added.wrapping_add(1);

        Ok(())
    }

    /// Free the chain rooted at `head`, returning its opaque token and
    /// restoring every link to the free-list. Stops at the first
    /// descriptor without `NEXT` set; an indirect head has no `NEXT` so it
    /// frees exactly the one main-table descriptor.
    fn free_chain(&mut self, head: u16) -> u64 {
        let token = self.opaque[head as usize].take().unwrap_or(0);
        let mut idx = head;
        loop {
            let desc = self.read_desc(idx);
            let has_next = desc.flags & VIRTQ_DESC_F_NEXT != 0;
            let link_next = desc.next;

            self.write_desc(idx, 0, 0, VIRTQ_DESC_F_NEXT, self.first_free);
            self.first_free = idx;
            self.num_free += 1;

            if !has_next {
                break;
            }
            idx = link_next;
        }
        token
    }

    /// Reap one completed request, if any. Returns `(token, bytes_written)`.
    pub fn get_buf(&mut self) -> Option<(u64, u32)> {
        let used_idx = self.read_used_idx();
        if self.last_used == used_idx {
            return None;
        }
        virtio_rmb();

        let slot = self.last_used % self.num;
        let (id, len) = self.read_used_elem(slot);
        let token = self.free_chain(id as u16);
        self.last_used = self.last_used.wrapping_add(1);

        if self.interrupts_enabled() && self.event_idx {
            self.write_avail_used_event(self.last_used);
            virtio_wmb();
        }

        Some((token, len))
    }

    /// Decide whether the host needs a doorbell write after the submits
    /// made since the previous call. Resets the added-since-kick counter.
    pub fn kick_prepare(&mut self) -> bool {
        virtio_mb();
        let new = self.shadow_avail_idx;
        let old = new.wrapping_sub(self.num_added);
        self.num_added = 0;

        if self.event_idx {
            let avail_event = self.read_used_avail_event();
            vring_need_event(avail_event, new, old)
        } else {
            self.read_used_flags() & VIRTQ_USED_F_NO_NOTIFY == 0
        }
    }

    /// Suppress interrupts until the next `enable_cb`/`enable_cb_delayed`.
    pub fn disable_cb(&mut self) {
        self.shadow_avail_flags |= VIRTQ_AVAIL_F_NO_INTERRUPT;
        self.write_avail_flags(self.shadow_avail_flags);
    }

    /// Re-arm for the next completion. Returns `true` iff nothing has
    /// completed in the meantime (the caller can safely wait for the next
    /// interrupt); `false` means it should reap immediately instead.
    pub fn enable_cb(&mut self) -> bool {
        self.shadow_avail_flags &= !VIRTQ_AVAIL_F_NO_INTERRUPT;
        self.write_avail_flags(self.shadow_avail_flags);
        self.write_avail_used_event(self.last_used);
        virtio_mb();
        self.last_used == self.read_used_idx()
    }

    /// Re-arm, but only request an interrupt once roughly three-quarters of
    /// outstanding work has completed.
    pub fn enable_cb_delayed(&mut self) -> bool {
        self.shadow_avail_flags &= !VIRTQ_AVAIL_F_NO_INTERRUPT;
        self.write_avail_flags(self.shadow_avail_flags);

        let outstanding = self.shadow_avail_idx.wrapping_sub(self.last_used);
        let bufs = ((outstanding as u32 * 3) / 4) as u16;
        let target = self.last_used.wrapping_add(bufs);
        self.write_avail_used_event(target);
        virtio_mb();

        self.read_used_idx().wrapping_sub(self.last_used) <= bufs
    }

    /// Free one outstanding request's chain and return its token, or `None`
    /// if the queue has nothing outstanding. Call repeatedly during
    /// teardown to recover every in-flight token.
    pub fn detach_unused(&mut self) -> Option<u64> {
        for i in 0..self.num {
            if self.opaque[i as usize].is_some() {
                let token = self.free_chain(i);
                self.shadow_avail_idx = self.shadow_avail_idx.wrapping_sub(1);
                self.write_avail_idx(self.shadow_avail_idx);
                return Some(token);
            }
        }
        None
    }

    /// Zero the ring memory and reconstruct the engine in place.
    pub fn shutdown(&mut self) {
        let layout = QueueLayout::compute(self.num, self.align, self.event_idx);
        unsafe {
            write_bytes(self.ring_virt.as_u64() as *mut u8, 0, layout.total_size as usize);
        }
        self.reinit_free_list();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec as StdVec;

    struct HostQueueView<'a> {
        vq: &'a mut Virtqueue,
    }

    impl<'a> HostQueueView<'a> {
        /// Simulate the host moving every currently-avail head straight to
        /// the used ring, verbatim, reporting `len` bytes written.
        fn consume_all(&mut self, len: u32) {
            let used_idx = unsafe { read_volatile(self.vq.used_idx_ptr()) };
            let avail_idx = unsafe { read_volatile(self.vq.avail_idx_ptr()) };
            let mut idx = used_idx;
            while idx != avail_idx {
                let slot = idx % self.vq.num;
                let head = unsafe { read_volatile(self.vq.avail_ring_ptr(slot)) };
                unsafe {
                    write_volatile(self.vq.used_ring_ptr(idx % self.vq.num), (head as u32, len));
                }
                idx = idx.wrapping_add(1);
            }
            unsafe { write_volatile(self.vq.used_idx_ptr(), idx) };
        }
    }

    fn alloc_ring(num: u16, align: u64, event_idx: bool) -> VirtAddr {
        let size = Virtqueue::ring_bytes(num, align, event_idx) as usize;
        let mut buf: StdVec<u8> = std::vec![0u8; size + 64];
        let addr = buf.as_mut_ptr() as u64;
        core::mem::forget(buf);
        VirtAddr::new(addr)
    }

    fn new_queue(num: u16, event_idx: bool) -> Virtqueue {
        let virt = alloc_ring(num, 64, event_idx);
        Virtqueue::new(num, 64, virt, PhysAddr::new(virt.as_u64()), event_idx).unwrap()
    }

    #[test]
    fn scenario_1_single_descriptor_round_trip() {
        let mut vq = new_queue(8, false);
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x1000), 64)], &[], 0xF0, None)
            .unwrap();

        assert_eq!(vq.num_free(), 7);
        let avail_idx = unsafe { read_volatile(vq.avail_idx_ptr()) };
        assert_eq!(avail_idx, 1);
        let head = unsafe { read_volatile(vq.avail_ring_ptr(0)) };
        assert_eq!(head, 0);
        let desc = vq.read_desc(0);
        assert_eq!(desc.addr, 0x1000);
        assert_eq!(desc.len, 64);
        assert_eq!(desc.flags, 0);

        HostQueueView { vq: &mut vq }.consume_all(64);

        let (token, len) = vq.get_buf().unwrap();
        assert_eq!(token, 0xF0);
        assert_eq!(len, 64);
        assert_eq!(vq.num_free(), 8);
    }

    #[test]
    fn scenario_2_chain_then_nospace() {
        let mut vq = new_queue(4, false);
        let out = [Chunk::new(PhysAddr::new(0x1000), 16), Chunk::new(PhysAddr::new(0x2000), 16)];
        let in_ = [Chunk::new(PhysAddr::new(0x3000), 16)];
        vq.add_buf(&out, &in_, 0x1, None).unwrap();

        assert_eq!(vq.num_free(), 1);
        let d0 = vq.read_desc(0);
        let d1 = vq.read_desc(1);
        let d2 = vq.read_desc(2);
        assert_eq!(d0.flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        assert_eq!(d1.flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        assert_eq!(d1.flags & VIRTQ_DESC_F_WRITE, 0);
        assert_eq!(d2.flags & VIRTQ_DESC_F_NEXT, 0);
        assert_eq!(d2.flags & VIRTQ_DESC_F_WRITE, VIRTQ_DESC_F_WRITE);

        let result = vq.add_buf(&out, &in_, 0x2, None);
        assert_eq!(result, Err(VirtioError::NoSpace));
        assert_eq!(vq.num_free(), 1);
    }

    #[test]
    fn scenario_3_indirect_descriptor() {
        let mut vq = new_queue(4, false);
        let mut page: StdVec<u8> = std::vec![0u8; 4 * size_of::<VirtqDesc>()];
        let page_virt = VirtAddr::new(page.as_mut_ptr() as u64);
        let page_phys = PhysAddr::new(page_virt.as_u64());

        let out = [Chunk::new(PhysAddr::new(0x10), 4), Chunk::new(PhysAddr::new(0x20), 4)];
        let in_ = [Chunk::new(PhysAddr::new(0x30), 4), Chunk::new(PhysAddr::new(0x40), 4)];
        vq.add_buf(&out, &in_, 0x7, Some(IndirectPage { virt: page_virt, phys: page_phys }))
            .unwrap();

        assert_eq!(vq.num_free(), 3);
        let head_desc = vq.read_desc(0);
        assert_eq!(head_desc.flags, VIRTQ_DESC_F_INDIRECT);
        assert_eq!(head_desc.addr, page_phys.as_u64());
        assert_eq!(head_desc.len, (4 * size_of::<VirtqDesc>()) as u32);

        let links: StdVec<VirtqDesc> = (0..4)
            .map(|i| unsafe {
                read_volatile((page_virt.as_u64() + i * size_of::<VirtqDesc>() as u64) as *const VirtqDesc)
            })
            .collect();
        assert_eq!(links[0].flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        assert_eq!(links[1].flags & VIRTQ_DESC_F_WRITE, 0);
        assert_eq!(links[2].flags & VIRTQ_DESC_F_WRITE, VIRTQ_DESC_F_WRITE);
        assert_eq!(links[3].flags & VIRTQ_DESC_F_WRITE, VIRTQ_DESC_F_WRITE);
        assert_eq!(links[3].flags & VIRTQ_DESC_F_NEXT, 0);
    }

    #[test]
    fn scenario_4_event_idx_kick_decision() {
        assert!(vring_need_event(5, 5, 4));
        assert!(!vring_need_event(5, 5, 5));
    }

    #[test]
    fn boundary_fills_then_nospace_with_no_state_change() {
        let mut vq = new_queue(2, false);
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x1), 1)], &[], 1, None).unwrap();
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x2), 1)], &[], 2, None).unwrap();
        assert_eq!(vq.num_free(), 0);

        let before = vq.num_free();
        let err = vq.add_buf(&[Chunk::new(PhysAddr::new(0x3), 1)], &[], 3, None);
        assert_eq!(err, Err(VirtioError::NoSpace));
        assert_eq!(vq.num_free(), before);
    }

    #[test]
    fn reap_returns_none_when_caught_up() {
        let mut vq = new_queue(4, false);
        assert!(vq.get_buf().is_none());
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x1), 1)], &[], 9, None).unwrap();
        assert!(vq.get_buf().is_none());
    }

    #[test]
    fn detach_unused_recovers_outstanding_tokens() {
        let mut vq = new_queue(4, false);
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x1), 1)], &[], 11, None).unwrap();
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x2), 1)], &[], 22, None).unwrap();
        assert_eq!(vq.num_free(), 2);

        let first = vq.detach_unused().unwrap();
        let second = vq.detach_unused().unwrap();
        assert_eq!(first, 11);
        assert_eq!(second, 22);
        assert!(vq.detach_unused().is_none());
        assert_eq!(vq.num_free(), 4);
    }

    #[test]
    fn shutdown_then_reconstruct_yields_fresh_state() {
        let mut vq = new_queue(4, false);
        vq.add_buf(&[Chunk::new(PhysAddr::new(0x1), 1)], &[], 1, None).unwrap();
        vq.shutdown();
        assert_eq!(vq.num_free(), 4);
        assert_eq!(unsafe { read_volatile(vq.avail_idx_ptr()) }, 0);
        assert_eq!(unsafe { read_volatile(vq.used_idx_ptr()) }, 0);
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let virt = alloc_ring(8, 64, false);
        let err = Virtqueue::new(3, 64, virt, PhysAddr::new(virt.as_u64()), false);
        assert!(matches!(err, Err(VirtioError::Invalid)));
    }

    #[test]
    fn wraparound_across_65536_submissions_is_handled() {
        let mut vq = new_queue(2, false);
        for round in 0u32..70_000 {
            let token = round as u64;
            vq.add_buf(&[Chunk::new(PhysAddr::new(0x100), 4)], &[], token, None).unwrap();
            HostQueueView { vq: &mut vq }.consume_all(4);
            let (got, _len) = vq.get_buf().unwrap();
            assert_eq!(got, token);
        }
        assert_eq!(vq.num_free(), 2);
    }
}
