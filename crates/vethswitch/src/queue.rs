//! Device-side access to split virtqueues in client shared memory.
//!
//! Every port owns two virtqueues whose descriptor table, available ring and
//! used ring live in the client's memory region.  The client fills the
//! available side; the switch walks descriptor chains, copies frame data and
//! publishes completions on the used side.  Everything read from that memory
//! is untrusted: indices are range-checked, chain walks are bounded by the
//! ring size, and violations surface as [`DescriptorError`] so the offending
//! device can be flagged without disturbing the rest of the switch.

use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

// ═══════════════════════════════════════════════════════════════════════
//  Ring constants (virtio 1.x split virtqueue)
// ═══════════════════════════════════════════════════════════════════════

/// Descriptor continues via the `next` field.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Buffer is device-writable.
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Device-set used-ring flag: the driver need not notify the device.
const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;
/// Driver-set available-ring flag: the device need not interrupt the driver.
const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

const DESC_SIZE: u64 = 16;
const USED_ELEM_SIZE: u64 = 8;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// A malformed or inaccessible structure was read from a client's ring.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// A descriptor index exceeded the ring size.
    #[error("descriptor index {index} out of range for a ring of {size} descriptors")]
    IndexOutOfRange {
        /// The offending index.
        index: u16,
        /// Ring size.
        size: u16,
    },

    /// A descriptor chain visited more descriptors than the ring holds.
    #[error("descriptor chain longer than the ring, assuming a loop")]
    ChainTooLong,

    /// A ring structure could not be read or written.
    #[error("ring memory at {addr:#x} is not accessible")]
    RingAccess {
        /// Client address of the failed access.
        addr: u64,
    },

    /// A descriptor's buffer lies outside the client's memory.
    #[error("buffer {addr:#x}+{len:#x} outside client memory")]
    BufferAccess {
        /// Buffer base address.
        addr: u64,
        /// Attempted access length.
        len: u32,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Descriptors and cursors
// ═══════════════════════════════════════════════════════════════════════

/// One virtqueue descriptor as read from the descriptor table.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtqDesc {
    /// Client address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// NEXT/WRITE flags.
    pub flags: u16,
    /// Index of the next descriptor when NEXT is set.
    pub next: u16,
}

/// Placement of one virtqueue inside the client's memory region.
///
/// The client configures these addresses during device setup; the switch
/// only consumes them.
#[derive(Clone, Copy, Debug)]
pub struct QueueLayout {
    /// Ring size in descriptors.
    pub size: u16,
    /// Descriptor table address.
    pub desc_addr: u64,
    /// Available ring address.
    pub avail_addr: u64,
    /// Used ring address.
    pub used_addr: u64,
}

/// Byte cursor into one descriptor buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct PktCursor {
    /// Client address of the next unread/unwritten byte.
    pub addr: u64,
    /// Bytes remaining in this buffer.
    pub left: u32,
}

impl PktCursor {
    /// Whether the buffer is exhausted.
    pub fn done(&self) -> bool {
        self.left == 0
    }

    /// Advance by up to `n` bytes, returning how far the cursor moved.
    ///
    /// The address is untrusted and may wrap; the next memory access on a
    /// wrapped cursor fails its bounds check.
    pub fn skip(&mut self, n: u32) -> u32 {
        let n = n.min(self.left);
        self.addr = self.addr.wrapping_add(u64::from(n));
        self.left -= n;
        n
    }
}

/// Read-only descriptor table handle.
///
/// Cloned into chain cursors so a parsed request can keep walking its chain
/// after the borrow on the queue has ended.
#[derive(Clone, Copy, Debug)]
pub struct RingGeometry {
    size: u16,
    desc_addr: u64,
}

impl RingGeometry {
    fn desc(&self, mem: &GuestMemoryMmap, index: u16) -> Result<VirtqDesc, DescriptorError> {
        if index >= self.size {
            return Err(DescriptorError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        let base = self.desc_addr + u64::from(index) * DESC_SIZE;
        let addr: u64 = mem
            .read_obj(GuestAddress(base))
            .map_err(|_| DescriptorError::RingAccess { addr: base })?;
        let len: u32 = mem
            .read_obj(GuestAddress(base + 8))
            .map_err(|_| DescriptorError::RingAccess { addr: base + 8 })?;
        let flags: u16 = mem
            .read_obj(GuestAddress(base + 12))
            .map_err(|_| DescriptorError::RingAccess { addr: base + 12 })?;
        let next: u16 = mem
            .read_obj(GuestAddress(base + 14))
            .map_err(|_| DescriptorError::RingAccess { addr: base + 14 })?;
        Ok(VirtqDesc {
            addr,
            len,
            flags,
            next,
        })
    }
}

/// Lazy walker over the remainder of one descriptor chain.
#[derive(Clone, Debug)]
pub struct ChainCursor {
    geom: RingGeometry,
    next: Option<u16>,
    walked: u16,
}

impl ChainCursor {
    /// A cursor over no chain at all; yields `None` immediately.
    pub(crate) fn empty(geom: RingGeometry) -> Self {
        Self {
            geom,
            next: None,
            walked: 0,
        }
    }

    /// Fetch the next buffer of the chain.
    ///
    /// Returns `Ok(None)` once the chain ends.  The walk is bounded by the
    /// ring size; exceeding it means the chain loops.
    pub fn next_buffer(
        &mut self,
        mem: &GuestMemoryMmap,
    ) -> Result<Option<PktCursor>, DescriptorError> {
        let Some(index) = self.next else {
            return Ok(None);
        };
        if self.walked >= self.geom.size {
            return Err(DescriptorError::ChainTooLong);
        }
        let d = self.geom.desc(mem, index)?;
        self.walked += 1;
        self.next = (d.flags & VIRTQ_DESC_F_NEXT != 0).then_some(d.next);
        Ok(Some(PktCursor {
            addr: d.addr,
            left: d.len,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VirtQueue
// ═══════════════════════════════════════════════════════════════════════

/// The device side of one split virtqueue.
///
/// Holds only the shadow available-ring cursor and the kick bookkeeping; the
/// ring content itself stays in client memory and is re-read on every access.
#[derive(Debug)]
pub struct VirtQueue {
    layout: QueueLayout,
    ready: bool,
    last_avail_idx: u16,
    do_kick: bool,
    kick_pending: bool,
}

impl VirtQueue {
    /// Wrap a client-configured ring.
    pub fn new(layout: QueueLayout) -> Self {
        Self {
            layout,
            ready: true,
            last_avail_idx: 0,
            do_kick: true,
            kick_pending: false,
        }
    }

    /// Whether the ring is live.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mark the ring live or dead (device reset).
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Descriptor table handle for chain cursors.
    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            size: self.layout.size,
            desc_addr: self.layout.desc_addr,
        }
    }

    fn read_avail_idx(&self, mem: &GuestMemoryMmap) -> Result<u16, DescriptorError> {
        let addr = self.layout.avail_addr + 2;
        mem.read_obj(GuestAddress(addr))
            .map_err(|_| DescriptorError::RingAccess { addr })
    }

    /// Whether the client has published descriptors we have not consumed.
    pub fn desc_avail(&self, mem: &GuestMemoryMmap) -> bool {
        self.ready
            && self
                .read_avail_idx(mem)
                .map_or(false, |idx| idx != self.last_avail_idx)
    }

    /// Consume the next available chain head, if any.
    pub fn pop_avail(&mut self, mem: &GuestMemoryMmap) -> Result<Option<u16>, DescriptorError> {
        if !self.ready {
            return Ok(None);
        }
        let avail_idx = self.read_avail_idx(mem)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        let slot = u64::from(self.last_avail_idx % self.layout.size);
        let addr = self.layout.avail_addr + 4 + slot * 2;
        let head: u16 = mem
            .read_obj(GuestAddress(addr))
            .map_err(|_| DescriptorError::RingAccess { addr })?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Return the last `chains` consumed heads to the available ring.
    ///
    /// Undoes [`pop_avail`](Self::pop_avail) so an aborted multi-chain
    /// transfer leaves the ring exactly as it found it.
    pub fn rewind_avail(&mut self, chains: u16) {
        self.last_avail_idx = self.last_avail_idx.wrapping_sub(chains);
    }

    /// Read the head descriptor of a chain.
    ///
    /// Returns the cursor over the rest of the chain and the first buffer.
    pub fn start(
        &self,
        mem: &GuestMemoryMmap,
        head: u16,
    ) -> Result<(ChainCursor, PktCursor), DescriptorError> {
        let geom = self.geometry();
        let d = geom.desc(mem, head)?;
        let chain = ChainCursor {
            geom,
            next: (d.flags & VIRTQ_DESC_F_NEXT != 0).then_some(d.next),
            walked: 1,
        };
        Ok((
            chain,
            PktCursor {
                addr: d.addr,
                left: d.len,
            },
        ))
    }

    fn write_used_elem(
        &self,
        mem: &GuestMemoryMmap,
        used_idx: u16,
        head: u16,
        len: u32,
    ) -> Result<(), DescriptorError> {
        let slot = u64::from(used_idx % self.layout.size);
        let addr = self.layout.used_addr + 4 + slot * USED_ELEM_SIZE;
        mem.write_obj(u32::from(head), GuestAddress(addr))
            .map_err(|_| DescriptorError::RingAccess { addr })?;
        mem.write_obj(len, GuestAddress(addr + 4))
            .map_err(|_| DescriptorError::RingAccess { addr: addr + 4 })?;
        Ok(())
    }

    fn read_used_idx(&self, mem: &GuestMemoryMmap) -> Result<u16, DescriptorError> {
        let addr = self.layout.used_addr + 2;
        mem.read_obj(GuestAddress(addr))
            .map_err(|_| DescriptorError::RingAccess { addr })
    }

    fn publish_used_idx(
        &self,
        mem: &GuestMemoryMmap,
        idx: u16,
    ) -> Result<(), DescriptorError> {
        // The elements must be visible before the index that publishes them.
        fence(Ordering::Release);
        let addr = self.layout.used_addr + 2;
        mem.write_obj(idx, GuestAddress(addr))
            .map_err(|_| DescriptorError::RingAccess { addr })
    }

    /// Complete one chain: put it on the used ring with `len` bytes written.
    pub fn add_used(
        &mut self,
        mem: &GuestMemoryMmap,
        head: u16,
        len: u32,
    ) -> Result<(), DescriptorError> {
        let used_idx = self.read_used_idx(mem)?;
        self.write_used_elem(mem, used_idx, head, len)?;
        self.publish_used_idx(mem, used_idx.wrapping_add(1))
    }

    /// Complete a merged frame: several chains, published with one index
    /// update so the client sees the frame at once.
    pub fn add_used_multi(
        &mut self,
        mem: &GuestMemoryMmap,
        entries: &[(u16, u32)],
    ) -> Result<(), DescriptorError> {
        let used_idx = self.read_used_idx(mem)?;
        for (i, &(head, len)) in entries.iter().enumerate() {
            self.write_used_elem(mem, used_idx.wrapping_add(i as u16), head, len)?;
        }
        self.publish_used_idx(mem, used_idx.wrapping_add(entries.len() as u16))
    }

    // ── Notification suppression ────────────────────────────────────────

    /// Tell the client not to kick us; set while a drain is in progress.
    pub fn disable_notify(&self, mem: &GuestMemoryMmap) {
        let _ = mem.write_obj(VIRTQ_USED_F_NO_NOTIFY, GuestAddress(self.layout.used_addr));
    }

    /// Allow client kicks again.
    pub fn enable_notify(&self, mem: &GuestMemoryMmap) {
        let _ = mem.write_obj(0u16, GuestAddress(self.layout.used_addr));
    }

    fn driver_no_interrupt(&self, mem: &GuestMemoryMmap) -> bool {
        mem.read_obj::<u16>(GuestAddress(self.layout.avail_addr))
            .map_or(false, |flags| flags & VIRTQ_AVAIL_F_NO_INTERRUPT != 0)
    }

    // ── Kick batching ───────────────────────────────────────────────────
    //
    // During a drain pass the switch disables kicks on every port, remembers
    // whether one became due, and emits at most one per port afterwards.

    /// Whether a client notification is due after a used-ring update.
    ///
    /// While kicks are disabled the request is remembered instead.
    pub fn needs_kick(&mut self, mem: &GuestMemoryMmap) -> bool {
        if self.driver_no_interrupt(mem) {
            return false;
        }
        if self.do_kick {
            true
        } else {
            self.kick_pending = true;
            false
        }
    }

    /// Suspend kicks and clear any remembered request.
    pub fn kick_disable_and_remember(&mut self) {
        self.do_kick = false;
        self.kick_pending = false;
    }

    /// Resume kicks; returns whether one became due while suspended.
    pub fn kick_enable_get_pending(&mut self) -> bool {
        self.do_kick = true;
        std::mem::take(&mut self.kick_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_mem, DriverRing};

    #[test]
    fn pop_avail_in_order() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let mut q = VirtQueue::new(layout);

        assert!(!q.desc_avail(&mem));
        let h0 = drv.push_chain(&[(0x10000, 64)]);
        let h1 = drv.push_chain(&[(0x11000, 64)]);
        assert!(q.desc_avail(&mem));

        assert_eq!(q.pop_avail(&mem).unwrap(), Some(h0));
        assert_eq!(q.pop_avail(&mem).unwrap(), Some(h1));
        assert_eq!(q.pop_avail(&mem).unwrap(), None);
        assert!(!q.desc_avail(&mem));
    }

    #[test]
    fn chain_walk_follows_links() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let q = VirtQueue::new(layout);

        let head = drv.push_chain(&[(0x10000, 10), (0x11000, 20), (0x12000, 30)]);
        let (mut chain, first) = q.start(&mem, head).unwrap();
        assert_eq!((first.addr, first.left), (0x10000, 10));
        let b = chain.next_buffer(&mem).unwrap().unwrap();
        assert_eq!((b.addr, b.left), (0x11000, 20));
        let b = chain.next_buffer(&mem).unwrap().unwrap();
        assert_eq!((b.addr, b.left), (0x12000, 30));
        assert!(chain.next_buffer(&mem).unwrap().is_none());
    }

    #[test]
    fn looping_chain_is_detected() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 4);
        let q = VirtQueue::new(layout);

        let head = drv.push_chain(&[(0x10000, 8), (0x11000, 8)]);
        // Point the second descriptor back at the first.
        drv.corrupt_desc_next(head.wrapping_add(1) % 4, head, true);

        let (mut chain, _) = q.start(&mem, head).unwrap();
        let mut err = None;
        for _ in 0..16 {
            match chain.next_buffer(&mem) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(err, Some(DescriptorError::ChainTooLong));
    }

    #[test]
    fn out_of_range_descriptor_index() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 4);
        let q = VirtQueue::new(layout);

        let head = drv.push_chain(&[(0x10000, 8)]);
        drv.corrupt_desc_next(head, 200, true);
        let (mut chain, _) = q.start(&mem, head).unwrap();
        assert!(matches!(
            chain.next_buffer(&mem),
            Err(DescriptorError::IndexOutOfRange { index: 200, size: 4 })
        ));
    }

    #[test]
    fn used_entries_appear_to_driver() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let mut q = VirtQueue::new(layout);

        let h0 = drv.push_chain(&[(0x10000, 64)]);
        let h1 = drv.push_chain(&[(0x11000, 64)]);
        q.pop_avail(&mem).unwrap();
        q.pop_avail(&mem).unwrap();

        q.add_used(&mem, h0, 12).unwrap();
        q.add_used_multi(&mem, &[(h1, 34)]).unwrap();
        assert_eq!(
            drv.used_entries(),
            vec![(u32::from(h0), 12), (u32::from(h1), 34)]
        );
    }

    #[test]
    fn rewind_returns_chains() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let mut q = VirtQueue::new(layout);

        let h0 = drv.push_chain(&[(0x10000, 64)]);
        assert_eq!(q.pop_avail(&mem).unwrap(), Some(h0));
        assert_eq!(q.pop_avail(&mem).unwrap(), None);
        q.rewind_avail(1);
        assert_eq!(q.pop_avail(&mem).unwrap(), Some(h0));
    }

    #[test]
    fn notify_suppression_flag() {
        let mem = test_mem();
        let (drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let q = VirtQueue::new(layout);

        q.disable_notify(&mem);
        assert_eq!(drv.used_flags(), VIRTQ_USED_F_NO_NOTIFY);
        q.enable_notify(&mem);
        assert_eq!(drv.used_flags(), 0);
    }

    #[test]
    fn kick_batching() {
        let mem = test_mem();
        let (mut drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let mut q = VirtQueue::new(layout);

        // Immediate mode: kicks are due right away.
        assert!(q.needs_kick(&mem));

        // Batched: remembered, emitted once on enable.
        q.kick_disable_and_remember();
        assert!(!q.needs_kick(&mem));
        assert!(!q.needs_kick(&mem));
        assert!(q.kick_enable_get_pending());
        assert!(!q.kick_enable_get_pending());

        // The driver can opt out of interrupts entirely.
        drv.set_no_interrupt(true);
        assert!(!q.needs_kick(&mem));
        drv.set_no_interrupt(false);
        assert!(q.needs_kick(&mem));
    }
}
