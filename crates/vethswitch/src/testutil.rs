//! Test fixtures: the driver side of the rings.
//!
//! Production code only ever plays the device role.  These helpers lay out
//! descriptor tables and rings in a memory region, publish chains the way a
//! client driver would, and read back completions, so tests can drive ports
//! end to end.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::mac::MacAddr;
use crate::port::{Port, PortClient};
use crate::queue::{QueueLayout, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

/// A fresh zeroed 1 MiB client memory region.
pub(crate) fn test_mem() -> GuestMemoryMmap {
    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).expect("guest memory")
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver-side ring
// ═══════════════════════════════════════════════════════════════════════

/// Driver's view of one virtqueue: writes descriptors and the available
/// ring, consumes the used ring.
pub(crate) struct DriverRing {
    mem: GuestMemoryMmap,
    layout: QueueLayout,
    avail_idx: u16,
    used_seen: u16,
    next_desc: u16,
    data_next: u64,
    chains: HashMap<u16, Vec<(u64, u32)>>,
}

impl DriverRing {
    /// Lay out a ring of `size` descriptors at `base`.
    ///
    /// The descriptor table, available ring and used ring live in the first
    /// 0x800 bytes; `base + 0x8000` onwards is a bump-allocated data area
    /// for buffers created via [`alloc`](Self::alloc).
    pub fn new(mem: &GuestMemoryMmap, base: u64, size: u16) -> (Self, QueueLayout) {
        let layout = QueueLayout {
            size,
            desc_addr: base,
            avail_addr: base + 0x400,
            used_addr: base + 0x600,
        };
        let ring = Self {
            mem: mem.clone(),
            layout,
            avail_idx: 0,
            used_seen: 0,
            next_desc: 0,
            data_next: base + 0x8000,
            chains: HashMap::new(),
        };
        (ring, layout)
    }

    /// Reserve `len` bytes in the data area.
    pub fn alloc(&mut self, len: usize) -> u64 {
        let addr = self.data_next;
        self.data_next += (len as u64 + 15) & !15;
        addr
    }

    fn write_desc(&self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = self.layout.desc_addr + u64::from(idx) * 16;
        self.mem.write_obj(addr, GuestAddress(base)).unwrap();
        self.mem.write_obj(len, GuestAddress(base + 8)).unwrap();
        self.mem.write_obj(flags, GuestAddress(base + 12)).unwrap();
        self.mem.write_obj(next, GuestAddress(base + 14)).unwrap();
    }

    fn push(&mut self, bufs: &[(u64, u32)], writable: bool) -> u16 {
        assert!(!bufs.is_empty());
        let size = self.layout.size;
        let head = self.next_desc % size;
        for (i, &(addr, len)) in bufs.iter().enumerate() {
            let idx = (head + i as u16) % size;
            let mut flags = if writable { VIRTQ_DESC_F_WRITE } else { 0 };
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_desc(idx, addr, len, flags, (idx + 1) % size);
        }
        self.next_desc = (head + bufs.len() as u16) % size;
        self.chains.insert(head, bufs.to_vec());

        let slot = u64::from(self.avail_idx % size);
        self.mem
            .write_obj(head, GuestAddress(self.layout.avail_addr + 4 + slot * 2))
            .unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.mem
            .write_obj(self.avail_idx, GuestAddress(self.layout.avail_addr + 2))
            .unwrap();
        head
    }

    /// Publish a device-readable chain over the given buffers.
    pub fn push_chain(&mut self, bufs: &[(u64, u32)]) -> u16 {
        self.push(bufs, false)
    }

    /// Allocate device-writable buffers of the given sizes and publish them
    /// as one receive chain.
    pub fn push_rx_chain(&mut self, sizes: &[u32]) -> u16 {
        let bufs: Vec<(u64, u32)> = sizes
            .iter()
            .map(|&len| (self.alloc(len as usize), len))
            .collect();
        self.push(&bufs, true)
    }

    /// Overwrite a descriptor's link, optionally forcing the NEXT flag.
    pub fn corrupt_desc_next(&mut self, idx: u16, next: u16, force_next: bool) {
        let base = self.layout.desc_addr + u64::from(idx) * 16;
        if force_next {
            self.mem
                .write_obj(VIRTQ_DESC_F_NEXT, GuestAddress(base + 12))
                .unwrap();
        }
        self.mem.write_obj(next, GuestAddress(base + 14)).unwrap();
    }

    /// Drain new used-ring entries as `(head, written_len)` pairs.
    pub fn used_entries(&mut self) -> Vec<(u32, u32)> {
        let used_idx: u16 = self
            .mem
            .read_obj(GuestAddress(self.layout.used_addr + 2))
            .unwrap();
        let mut out = Vec::new();
        while self.used_seen != used_idx {
            let slot = u64::from(self.used_seen % self.layout.size);
            let base = self.layout.used_addr + 4 + slot * 8;
            let head: u32 = self.mem.read_obj(GuestAddress(base)).unwrap();
            let len: u32 = self.mem.read_obj(GuestAddress(base + 4)).unwrap();
            out.push((head, len));
            self.used_seen = self.used_seen.wrapping_add(1);
        }
        out
    }

    /// Current used-ring flags word (notification suppression).
    pub fn used_flags(&self) -> u16 {
        self.mem
            .read_obj(GuestAddress(self.layout.used_addr))
            .unwrap()
    }

    /// Set or clear the driver-side "no interrupt needed" flag.
    pub fn set_no_interrupt(&mut self, on: bool) {
        self.mem
            .write_obj(u16::from(on), GuestAddress(self.layout.avail_addr))
            .unwrap();
    }

    /// The buffers a pushed chain was built over.
    pub fn chain_buffers(&self, head: u16) -> Vec<(u64, u32)> {
        self.chains[&head].clone()
    }

    fn chain_bytes(&self, head: u16, mut want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for &(addr, len) in &self.chains[&head] {
            if want == 0 {
                break;
            }
            let take = want.min(len as usize);
            let mut buf = vec![0u8; take];
            self.mem.read_slice(&mut buf, GuestAddress(addr)).unwrap();
            out.extend_from_slice(&buf);
            want -= take;
        }
        out
    }

    /// Reassemble delivered frames from the used ring.
    ///
    /// Follows the merged-buffer discipline: the first chain's virtio-net
    /// header announces how many chains belong to the frame.  Headers are
    /// stripped.
    pub fn received_frames(&mut self) -> Vec<Vec<u8>> {
        let entries = self.used_entries();
        let mut frames = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let (head, len) = entries[i];
            let first = self.chain_bytes(head as u16, len as usize);
            assert!(first.len() >= 12, "first chain shorter than the header");
            let num_buffers = u16::from_le_bytes([first[10], first[11]]) as usize;
            assert!(num_buffers >= 1, "num_buffers not set");
            let mut frame = first[12..].to_vec();
            for j in 1..num_buffers {
                let (h, l) = entries[i + j];
                frame.extend_from_slice(&self.chain_bytes(h as u16, l as usize));
            }
            frames.push(frame);
            i += num_buffers;
        }
        frames
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Frames
// ═══════════════════════════════════════════════════════════════════════

/// Build an untagged Ethernet frame (IPv4 ethertype).
pub(crate) fn eth_frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

    let mut buf = vec![0u8; EthernetFrame::<&[u8]>::buffer_len(payload.len())];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    frame.set_dst_addr(EthernetAddress(dst));
    frame.set_src_addr(EthernetAddress(src));
    frame.set_ethertype(EthernetProtocol::Ipv4);
    frame.payload_mut().copy_from_slice(payload);
    buf
}

/// Build an 802.1Q-tagged frame by splicing a tag into an untagged one.
pub(crate) fn tagged_frame(dst: [u8; 6], src: [u8; 6], vid: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = eth_frame(dst, src, payload);
    frame.splice(
        12..12,
        [0x81, 0x00, (vid >> 8) as u8, (vid & 0xff) as u8],
    );
    frame
}

/// Prepend a zeroed virtio-net header, as a client driver would.
pub(crate) fn with_net_hdr(frame: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(frame);
    data
}

// ═══════════════════════════════════════════════════════════════════════
//  Port fixture
// ═══════════════════════════════════════════════════════════════════════

/// Client endpoint that counts kicks and can be declared dead.
pub(crate) struct TestClient {
    kicks: Rc<Cell<usize>>,
    alive: Rc<Cell<bool>>,
}

impl PortClient for TestClient {
    fn notify(&self) {
        self.kicks.set(self.kicks.get() + 1);
    }

    fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

/// The driver half of a test port: both rings plus the client endpoint
/// state, kept after the [`Port`] itself moved into a switch.
pub(crate) struct PortHarness {
    pub mem: GuestMemoryMmap,
    pub tx: DriverRing,
    pub rx: DriverRing,
    pub kicks: Rc<Cell<usize>>,
    pub alive: Rc<Cell<bool>>,
}

impl PortHarness {
    /// Queue one frame (header prepended) as a single-descriptor chain.
    pub fn send(&mut self, frame: &[u8]) -> u16 {
        let data = with_net_hdr(frame);
        let addr = self.tx.alloc(data.len());
        self.mem.write_slice(&data, GuestAddress(addr)).unwrap();
        self.tx.push_chain(&[(addr, data.len() as u32)])
    }

    /// Queue one frame split into descriptors at the given offsets into the
    /// header-plus-frame bytes.
    pub fn send_split(&mut self, frame: &[u8], splits: &[usize]) -> u16 {
        let data = with_net_hdr(frame);
        let mut bufs = Vec::new();
        let mut prev = 0;
        for &at in splits.iter().chain(&[data.len()]) {
            let addr = self.tx.alloc(at - prev);
            self.mem
                .write_slice(&data[prev..at], GuestAddress(addr))
                .unwrap();
            bufs.push((addr, (at - prev) as u32));
            prev = at;
        }
        self.tx.push_chain(&bufs)
    }

    /// Give the port one writable receive chain of `sizes` buffers.
    pub fn add_rx_chain(&mut self, sizes: &[u32]) -> u16 {
        self.rx.push_rx_chain(sizes)
    }

    /// Frames delivered to this port so far, oldest first.
    pub fn frames(&mut self) -> Vec<Vec<u8>> {
        self.rx.received_frames()
    }

    /// Client kicks received so far.
    pub fn kicks(&self) -> usize {
        self.kicks.get()
    }
}

/// Build a port over a fresh memory region, with 16-descriptor rings.
pub(crate) fn test_port(name: &str, mac: Option<MacAddr>) -> (Port, PortHarness) {
    let mem = test_mem();
    let (tx, tx_layout) = DriverRing::new(&mem, 0x1_0000, 16);
    let (rx, rx_layout) = DriverRing::new(&mem, 0x3_0000, 16);
    let kicks = Rc::new(Cell::new(0));
    let alive = Rc::new(Cell::new(true));
    let client = Box::new(TestClient {
        kicks: Rc::clone(&kicks),
        alive: Rc::clone(&alive),
    });
    let port = Port::new(name, mac, mem.clone(), rx_layout, tx_layout, client);
    (
        port,
        PortHarness {
            mem,
            tx,
            rx,
            kicks,
            alive,
        },
    )
}
