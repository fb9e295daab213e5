//! The cross-queue transfer engine.
//!
//! Copies one parsed request into one destination receive ring.  Three
//! constraints shape the loop: source and destination chains have unrelated
//! boundaries, the destination uses merged receive buffers (one frame may
//! span several chains, announced via `num_buffers` in the first chain's
//! header), and the VLAN mangle may add or drop four bytes at an offset that
//! can straddle any of those boundaries.
//!
//! The engine is a straight loop over the source bytes.  Destination chains
//! are pulled as needed; a fully written chain is parked on the consumed
//! list and completed together with the rest when the source runs dry, so
//! the client observes the whole frame in a single used-ring update.  If the
//! destination ring runs out of chains mid-frame, everything pulled so far
//! is rewound and the frame is dropped; the receiver never sees a torn
//! frame.

use log::trace;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::queue::{ChainCursor, DescriptorError, PktCursor, VirtQueue};
use crate::request::{NetRequest, NET_HDR_SIZE, NUM_BUFFERS_OFFSET};
use crate::vlan::VlanMangle;

// ═══════════════════════════════════════════════════════════════════════
//  Outcomes
// ═══════════════════════════════════════════════════════════════════════

/// How a transfer ended, when the destination ring stayed healthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was written and completed; the client owes a look.
    Delivered {
        /// Frame bytes delivered, headers excluded.
        bytes: u32,
    },
    /// No (or not enough) destination chains; the ring was left untouched.
    Dropped,
}

/// A transfer that could not run to a clean end.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The source chain is malformed; the source device must be flagged and
    /// the current drain aborted.  The destination was rewound.
    #[error("source chain fault: {0}")]
    Source(DescriptorError),

    /// The destination ring is malformed; the destination device must be
    /// flagged and its ring not touched again.
    #[error("destination ring fault: {0}")]
    Dest(DescriptorError),

    /// The first destination buffer cannot even hold the virtio-net header.
    /// The pulled chain was rewound and the frame dropped.
    #[error("first destination buffer too small for the virtio-net header")]
    HeaderSpace,
}

/// Destination chain currently being filled; `head` is `None` between
/// chains, exactly like the nullable head handle it replaces.
struct DstChain {
    head: Option<u16>,
    chain: ChainCursor,
    cur: PktCursor,
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

/// Refill `cur` from the chain until it has bytes or the chain ends.
fn advance_src(
    mem: &GuestMemoryMmap,
    cur: &mut PktCursor,
    chain: &mut ChainCursor,
) -> Result<bool, DescriptorError> {
    while cur.done() {
        match chain.next_buffer(mem)? {
            Some(next) => *cur = next,
            None => return Ok(true),
        }
    }
    Ok(false)
}

/// Deliver `req` into `dst_q`, rewriting the VLAN tag per `mangle`.
///
/// # Errors
///
/// See [`TransferError`] for the fault contract per side.
pub(crate) fn transfer(
    req: &NetRequest,
    dst_mem: &GuestMemoryMmap,
    dst_q: &mut VirtQueue,
    mut mangle: VlanMangle,
) -> Result<Delivery, TransferError> {
    let src_mem = req.mem();
    let (mut src_cur, mut src_chain) = req.copy_cursor();

    let mut d = DstChain {
        head: None,
        chain: ChainCursor::empty(dst_q.geometry()),
        cur: PktCursor::default(),
    };
    let mut consumed: Vec<(u16, u32)> = Vec::new();
    let mut num_merged: u16 = 0;
    let mut total: u32 = 0;
    let mut hdr_addr: Option<u64> = None;

    loop {
        match advance_src(src_mem, &mut src_cur, &mut src_chain) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                let pulled = consumed.len() as u16 + u16::from(d.head.is_some());
                dst_q.rewind_avail(pulled);
                return Err(TransferError::Source(e));
            }
        }

        if d.head.is_none() {
            if !dst_q.is_ready() {
                dst_q.rewind_avail(consumed.len() as u16);
                return Ok(Delivery::Dropped);
            }
            let head = match dst_q.pop_avail(dst_mem) {
                // Must not touch the destination ring after this.
                Err(e) => return Err(TransferError::Dest(e)),
                Ok(None) => {
                    trace!("destination ring depleted, dropping");
                    dst_q.rewind_avail(consumed.len() as u16);
                    return Ok(Delivery::Dropped);
                }
                Ok(Some(head)) => head,
            };
            let (chain, mut first) = match dst_q.start(dst_mem, head) {
                Ok(r) => r,
                Err(e) => return Err(TransferError::Dest(e)),
            };
            if hdr_addr.is_none() {
                // The header is copied verbatim into the very first buffer;
                // num_buffers is patched when the frame is done.
                if first.left < NET_HDR_SIZE {
                    dst_q.rewind_avail(1);
                    return Err(TransferError::HeaderSpace);
                }
                let mut hdr = *req.header();
                mangle.rewrite_hdr(&mut hdr);
                dst_mem
                    .write_obj(hdr, GuestAddress(first.addr))
                    .map_err(|_| {
                        TransferError::Dest(DescriptorError::BufferAccess {
                            addr: first.addr,
                            len: NET_HDR_SIZE,
                        })
                    })?;
                hdr_addr = Some(first.addr);
                total = NET_HDR_SIZE;
                first.skip(NET_HDR_SIZE);
            }
            num_merged += 1;
            d = DstChain {
                head: Some(head),
                chain,
                cur: first,
            };
        }

        let has_dst_buffer = if !d.cur.done() {
            true
        } else {
            match d.chain.next_buffer(dst_mem) {
                Ok(Some(next)) => {
                    d.cur = next;
                    true
                }
                Ok(None) => false,
                Err(e) => return Err(TransferError::Dest(e)),
            }
        };

        if has_dst_buffer {
            match mangle.copy_pkt(src_mem, &mut src_cur, dst_mem, &mut d.cur) {
                Ok(n) => total += n,
                Err(e @ TransferError::Source(_)) => {
                    let pulled = consumed.len() as u16 + 1;
                    dst_q.rewind_avail(pulled);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        } else if let Some(head) = d.head.take() {
            // Chain filled; park it and start the next merged chain.
            trace!("saving filled chain {head} ({total} bytes)");
            consumed.push((head, total));
            total = 0;
        }
    }

    let Some(hdr_addr) = hdr_addr else {
        return Ok(Delivery::Dropped);
    };
    dst_mem
        .write_obj(num_merged, GuestAddress(hdr_addr + NUM_BUFFERS_OFFSET))
        .map_err(|_| {
            TransferError::Dest(DescriptorError::BufferAccess {
                addr: hdr_addr + NUM_BUFFERS_OFFSET,
                len: 2,
            })
        })?;

    let written: u32 = consumed.iter().map(|&(_, len)| len).sum::<u32>() + total;
    let result = match d.head {
        Some(head) if consumed.is_empty() => dst_q.add_used(dst_mem, head, total),
        Some(head) => {
            consumed.push((head, total));
            dst_q.add_used_multi(dst_mem, &consumed)
        }
        // The source ran dry exactly at a chain boundary.
        None => dst_q.add_used_multi(dst_mem, &consumed),
    };
    result.map_err(TransferError::Dest)?;

    Ok(Delivery::Delivered {
        bytes: written - NET_HDR_SIZE,
    })
}
