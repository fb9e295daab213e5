//! 802.1Q VLAN identifiers and the tag-rewriting copy engine.

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::queue::{DescriptorError, PktCursor};
use crate::request::VirtioNetHdr;
use crate::transfer::TransferError;

/// Pseudo VLAN id for untagged traffic on native ports.
pub const VLAN_ID_NATIVE: u16 = 0xffff;
/// Pseudo VLAN id marking trunk ports; never appears on the wire.
pub const VLAN_ID_TRUNK: u16 = 0xfffe;

/// Whether `id` is a configurable VLAN id (1..=4094).
pub fn vlan_valid_id(id: u16) -> bool {
    id > 0 && id < 0xfff
}

/// The tag transform applied while a frame is copied between ports.
///
/// The transform is positional: the 4-byte 802.1Q tag sits right after the
/// twelve address bytes of the Ethernet header, but source and destination
/// descriptor boundaries fall anywhere.  The mangle therefore tracks how many
/// address bytes and tag bytes are still outstanding and is driven by
/// repeated [`copy_pkt`](Self::copy_pkt) calls, each of which makes whatever
/// progress the current pair of buffers allows.
#[derive(Clone, Copy, Debug, Default)]
pub struct VlanMangle {
    tci: u16,
    mac_remaining: u8,
    tag_remaining: i8,
}

impl VlanMangle {
    /// Copy the frame untouched.
    pub fn none() -> Self {
        Self::default()
    }

    /// Splice in a tag with the given TCI (PCP/DEI zero, VID in the low
    /// twelve bits).  The caller must know the frame is untagged.
    pub fn add(tci: u16) -> Self {
        Self {
            tci,
            mac_remaining: 12,
            tag_remaining: 4,
        }
    }

    /// Strip the tag.  The caller must know the frame is tagged.
    pub fn remove() -> Self {
        Self {
            tci: 0xffff,
            mac_remaining: 12,
            tag_remaining: -4,
        }
    }

    /// Copy bytes from `src` to `dst`, rewriting the tag on the way.
    ///
    /// Returns the number of bytes written to `dst`; zero is valid as long
    /// as overall progress is made (the caller refills whichever cursor ran
    /// dry).  Tag removal consumes source bytes without producing output.
    ///
    /// # Errors
    ///
    /// Fails with a source- or destination-attributed [`DescriptorError`]
    /// when a buffer read or write leaves client memory.
    pub fn copy_pkt(
        &mut self,
        src_mem: &GuestMemoryMmap,
        src: &mut PktCursor,
        dst_mem: &GuestMemoryMmap,
        dst: &mut PktCursor,
    ) -> Result<u32, TransferError> {
        if self.tci == 0 {
            // Pass through (no tag work, or tag kept as-is).
            return copy_chunk(src_mem, src, dst_mem, dst, u32::MAX);
        }
        if self.mac_remaining > 0 {
            let n = copy_chunk(src_mem, src, dst_mem, dst, u32::from(self.mac_remaining))?;
            self.mac_remaining -= n as u8;
            return Ok(n);
        }
        if self.tag_remaining > 0 {
            let tag = [
                0x81,
                0x00,
                (self.tci >> 8) as u8,
                (self.tci & 0xff) as u8,
            ];
            let n = (self.tag_remaining as u32).min(dst.left);
            if n == 0 {
                return Ok(0);
            }
            let off = 4 - self.tag_remaining as usize;
            dst_mem
                .write_slice(&tag[off..off + n as usize], GuestAddress(dst.addr))
                .map_err(|_| {
                    TransferError::Dest(DescriptorError::BufferAccess {
                        addr: dst.addr,
                        len: n,
                    })
                })?;
            dst.skip(n);
            self.tag_remaining -= n as i8;
            return Ok(n);
        }
        if self.tag_remaining < 0 {
            let skipped = src.skip((-self.tag_remaining) as u32);
            self.tag_remaining += skipped as i8;
            return Ok(0);
        }
        copy_chunk(src_mem, src, dst_mem, dst, u32::MAX)
    }

    /// Hook invoked once per frame after the virtio-net header was copied.
    ///
    /// The header passes through verbatim; only `num_buffers` is rewritten,
    /// and that happens when the transfer finishes.
    pub fn rewrite_hdr(&self, _hdr: &mut VirtioNetHdr) {}
}

#[cfg(test)]
impl VlanMangle {
    pub(crate) fn is_add(&self) -> bool {
        self.tag_remaining > 0
    }

    pub(crate) fn is_remove(&self) -> bool {
        self.tag_remaining < 0
    }

    pub(crate) fn is_none_transform(&self) -> bool {
        self.tci == 0
    }
}

/// Copy up to `limit` bytes between the cursors, bounded by both buffers.
fn copy_chunk(
    src_mem: &GuestMemoryMmap,
    src: &mut PktCursor,
    dst_mem: &GuestMemoryMmap,
    dst: &mut PktCursor,
    limit: u32,
) -> Result<u32, TransferError> {
    let n = limit.min(src.left).min(dst.left);
    if n == 0 {
        return Ok(0);
    }
    let s = src_mem
        .get_slice(GuestAddress(src.addr), n as usize)
        .map_err(|_| {
            TransferError::Source(DescriptorError::BufferAccess {
                addr: src.addr,
                len: n,
            })
        })?;
    let d = dst_mem
        .get_slice(GuestAddress(dst.addr), n as usize)
        .map_err(|_| {
            TransferError::Dest(DescriptorError::BufferAccess {
                addr: dst.addr,
                len: n,
            })
        })?;
    s.copy_to_volatile_slice(d);
    src.skip(n);
    dst.skip(n);
    Ok(n)
}
