//! Parsed view over one transmit descriptor chain.
//!
//! Every frame a client transmits starts with the virtio-net header, followed
//! by the Ethernet frame, spread over one or more descriptors.  To make a
//! switching decision we need the leading frame bytes (addresses, possible
//! VLAN tag) while the header stays available for the later copy, so the
//! request keeps two positions: the copied header and a cursor standing on
//! the first frame byte.

use log::warn;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

use crate::mac::MacAddr;
use crate::queue::{ChainCursor, DescriptorError, PktCursor, VirtQueue};
use crate::vlan::VLAN_ID_NATIVE;

/// The virtio-net header preceding every frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    /// NEEDS_CSUM / DATA_VALID flags.
    pub flags: u8,
    /// GSO type, passed through.
    pub gso_type: u8,
    /// Length of the headers GSO applies to.
    pub hdr_len: u16,
    /// GSO segment size.
    pub gso_size: u16,
    /// Start of the checksummed region.
    pub csum_start: u16,
    /// Offset of the checksum within that region.
    pub csum_offset: u16,
    /// Number of merged receive chains; written by the switch on delivery.
    pub num_buffers: u16,
}

// Plain bytes, no padding: 2×u8 + 5×u16.
unsafe impl ByteValued for VirtioNetHdr {}

/// Header size on the wire.
pub const NET_HDR_SIZE: u32 = std::mem::size_of::<VirtioNetHdr>() as u32;

/// Byte offset of `num_buffers` within the header.
pub(crate) const NUM_BUFFERS_OFFSET: u64 = 10;

/// Result of pulling from a transmit ring.
pub(crate) enum PullOutcome {
    /// Ring empty or not ready.
    Empty,
    /// A head was consumed but no request could be parsed from it; the
    /// caller must finish the head with zero bytes.
    Invalid { head: u16 },
    /// A parsed request.
    Request(NetRequest),
}

/// One frame pulled from a source port's transmit ring.
///
/// The request owns no ring state except the head it was built from; the
/// source ring is only touched again when the switch finishes the head after
/// forwarding (or dropping) the frame.
pub struct NetRequest {
    head: u16,
    header: VirtioNetHdr,
    pkt: PktCursor,
    chain: ChainCursor,
    mem: GuestMemoryMmap,
}

impl NetRequest {
    /// Parse the next available chain of `queue` into a request.
    ///
    /// The header must fit the first descriptor contiguously; the frame
    /// cursor crosses into the next descriptor if the header exhausts the
    /// first one.
    ///
    /// # Errors
    ///
    /// Propagates [`DescriptorError`] for malformed chains; the caller flags
    /// the source device.
    pub(crate) fn from_next_available(
        mem: &GuestMemoryMmap,
        queue: &mut VirtQueue,
    ) -> Result<PullOutcome, DescriptorError> {
        let Some(head) = queue.pop_avail(mem)? else {
            return Ok(PullOutcome::Empty);
        };
        let (mut chain, mut pkt) = queue.start(mem, head)?;

        if pkt.left < NET_HDR_SIZE {
            warn!("invalid request: {} byte first descriptor", pkt.left);
            return Ok(PullOutcome::Invalid { head });
        }
        let header: VirtioNetHdr = mem
            .read_obj(GuestAddress(pkt.addr))
            .map_err(|_| DescriptorError::BufferAccess {
                addr: pkt.addr,
                len: NET_HDR_SIZE,
            })?;
        pkt.skip(NET_HDR_SIZE);
        if pkt.done() {
            match chain.next_buffer(mem)? {
                Some(next) => pkt = next,
                None => {
                    warn!("invalid request: no frame data after header");
                    return Ok(PullOutcome::Invalid { head });
                }
            }
        }

        Ok(PullOutcome::Request(NetRequest {
            head,
            header,
            pkt,
            chain,
            mem: mem.clone(),
        }))
    }

    /// The chain head, needed to finish the source ring.
    pub(crate) fn head(&self) -> u16 {
        self.head
    }

    /// The frame's virtio-net header.
    pub fn header(&self) -> &VirtioNetHdr {
        &self.header
    }

    /// The source client's memory region.
    pub(crate) fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Private copy of the frame position for one transfer.
    ///
    /// A broadcast request is copied once per destination; each transfer
    /// walks the chain with its own cursor starting at the first frame byte.
    pub(crate) fn copy_cursor(&self) -> (PktCursor, ChainCursor) {
        (self.pkt, self.chain.clone())
    }

    fn frame_bytes<const N: usize>(&self) -> Option<[u8; N]> {
        if (self.pkt.left as usize) < N {
            return None;
        }
        let mut buf = [0u8; N];
        self.mem
            .read_slice(&mut buf, GuestAddress(self.pkt.addr))
            .ok()?;
        Some(buf)
    }

    /// Destination MAC of the frame, `UNKNOWN` if the read is out of range.
    pub fn dst_mac(&self) -> MacAddr {
        self.frame_bytes::<6>()
            .map_or(MacAddr::UNKNOWN, MacAddr::from_bytes)
    }

    /// Source MAC of the frame, `UNKNOWN` if the read is out of range.
    pub fn src_mac(&self) -> MacAddr {
        self.frame_bytes::<12>().map_or(MacAddr::UNKNOWN, |b| {
            let mut src = [0u8; 6];
            src.copy_from_slice(&b[6..12]);
            MacAddr::from_bytes(src)
        })
    }

    /// Whether the frame carries an 802.1Q tag.
    pub fn has_vlan(&self) -> bool {
        self.frame_bytes::<14>()
            .map_or(false, |b| b[12] == 0x81 && b[13] == 0x00)
    }

    /// The frame's VLAN id, [`VLAN_ID_NATIVE`] when untagged or truncated.
    pub fn vlan_id(&self) -> u16 {
        if !self.has_vlan() {
            return VLAN_ID_NATIVE;
        }
        self.frame_bytes::<16>().map_or(VLAN_ID_NATIVE, |b| {
            (u16::from(b[14]) << 8 | u16::from(b[15])) & 0xfff
        })
    }

    /// The leading frame bytes available in the first buffer, for the
    /// mirror filter.  At most `buf.len()` bytes are produced.
    pub fn peek<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        let n = (self.pkt.left as usize).min(buf.len());
        if self
            .mem
            .read_slice(&mut buf[..n], GuestAddress(self.pkt.addr))
            .is_err()
        {
            return &buf[..0];
        }
        &buf[..n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{eth_frame, tagged_frame, test_mem, with_net_hdr, DriverRing};

    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0xa];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0xb];

    fn setup() -> (GuestMemoryMmap, DriverRing, VirtQueue) {
        let mem = test_mem();
        let (drv, layout) = DriverRing::new(&mem, 0x1000, 8);
        let q = VirtQueue::new(layout);
        (mem, drv, q)
    }

    #[test]
    fn header_layout() {
        assert_eq!(NET_HDR_SIZE, 12);
        let hdr = VirtioNetHdr {
            num_buffers: 0xabcd,
            ..Default::default()
        };
        let bytes = hdr.as_slice();
        assert_eq!(&bytes[NUM_BUFFERS_OFFSET as usize..], &[0xcd, 0xab]);
    }

    #[test]
    fn parse_single_descriptor_frame() {
        let (mem, mut drv, mut q) = setup();
        let frame = eth_frame(MAC_B, MAC_A, &[0x55; 46]);
        let data = with_net_hdr(&frame);
        mem.write_slice(&data, GuestAddress(0x10000)).unwrap();
        drv.push_chain(&[(0x10000, data.len() as u32)]);

        let PullOutcome::Request(req) = NetRequest::from_next_available(&mem, &mut q).unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(req.dst_mac(), MacAddr::from_bytes(MAC_B));
        assert_eq!(req.src_mac(), MacAddr::from_bytes(MAC_A));
        assert!(!req.has_vlan());
        assert_eq!(req.vlan_id(), VLAN_ID_NATIVE);
    }

    #[test]
    fn header_exhausting_first_descriptor_crosses_chain() {
        let (mem, mut drv, mut q) = setup();
        let frame = eth_frame(MAC_B, MAC_A, &[0x66; 32]);
        let data = with_net_hdr(&frame);
        // Header alone in descriptor 0, frame in descriptor 1.
        mem.write_slice(&data[..12], GuestAddress(0x10000)).unwrap();
        mem.write_slice(&data[12..], GuestAddress(0x11000)).unwrap();
        drv.push_chain(&[(0x10000, 12), (0x11000, (data.len() - 12) as u32)]);

        let PullOutcome::Request(req) = NetRequest::from_next_available(&mem, &mut q).unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(req.dst_mac(), MacAddr::from_bytes(MAC_B));
        assert_eq!(req.src_mac(), MacAddr::from_bytes(MAC_A));
    }

    #[test]
    fn vlan_tag_detected() {
        let (mem, mut drv, mut q) = setup();
        let frame = tagged_frame(MAC_B, MAC_A, 0xabc, &[0x77; 40]);
        let data = with_net_hdr(&frame);
        mem.write_slice(&data, GuestAddress(0x10000)).unwrap();
        drv.push_chain(&[(0x10000, data.len() as u32)]);

        let PullOutcome::Request(req) = NetRequest::from_next_available(&mem, &mut q).unwrap()
        else {
            panic!("expected request");
        };
        assert!(req.has_vlan());
        assert_eq!(req.vlan_id(), 0xabc);
    }

    #[test]
    fn short_first_descriptor_is_invalid() {
        let (mem, mut drv, mut q) = setup();
        let head = drv.push_chain(&[(0x10000, 6)]);
        match NetRequest::from_next_available(&mem, &mut q).unwrap() {
            PullOutcome::Invalid { head: h } => assert_eq!(h, head),
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn header_only_chain_is_invalid() {
        let (mem, mut drv, mut q) = setup();
        let head = drv.push_chain(&[(0x10000, 12)]);
        match NetRequest::from_next_available(&mem, &mut q).unwrap() {
            PullOutcome::Invalid { head: h } => assert_eq!(h, head),
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn empty_ring_yields_empty() {
        let (mem, _drv, mut q) = setup();
        assert!(matches!(
            NetRequest::from_next_available(&mem, &mut q).unwrap(),
            PullOutcome::Empty
        ));
    }

    #[test]
    fn truncated_frame_reads_are_bounded() {
        let (mem, mut drv, mut q) = setup();
        // 12-byte header plus only 8 frame bytes: dst is readable, src not.
        let mut data = vec![0u8; 20];
        data[12..18].copy_from_slice(&MAC_B);
        mem.write_slice(&data, GuestAddress(0x10000)).unwrap();
        drv.push_chain(&[(0x10000, data.len() as u32)]);

        let PullOutcome::Request(req) = NetRequest::from_next_available(&mem, &mut q).unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(req.dst_mac(), MacAddr::from_bytes(MAC_B));
        assert_eq!(req.src_mac(), MacAddr::UNKNOWN);
        assert!(!req.has_vlan());
        assert_eq!(req.vlan_id(), VLAN_ID_NATIVE);
    }

    #[test]
    fn peek_is_bounded_by_first_buffer() {
        let (mem, mut drv, mut q) = setup();
        let frame = eth_frame(MAC_B, MAC_A, &[0x11; 20]);
        let data = with_net_hdr(&frame);
        mem.write_slice(&data, GuestAddress(0x10000)).unwrap();
        drv.push_chain(&[(0x10000, data.len() as u32)]);

        let PullOutcome::Request(req) = NetRequest::from_next_available(&mem, &mut q).unwrap()
        else {
            panic!("expected request");
        };
        let mut buf = [0u8; 64];
        let peeked = req.peek(&mut buf);
        assert_eq!(peeked.len(), frame.len());
        assert_eq!(peeked, &frame[..]);
    }
}
