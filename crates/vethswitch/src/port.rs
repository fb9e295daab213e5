//! A port on the switch.
//!
//! A port ties together one client's memory region, its two rings, the VLAN
//! configuration, an optional MAC address and the client endpoint used for
//! kick delivery and liveness checks.  A port on its own cannot forward,
//! having no knowledge of other ports, so the switch pulls requests out of
//! it and hands them to destination ports.

use std::collections::BTreeSet;

use log::{debug, warn};
use vm_memory::GuestMemoryMmap;

use vethswitch_stats::PortCounters;

use crate::mac::MacAddr;
use crate::queue::{DescriptorError, QueueLayout, VirtQueue};
use crate::request::{NetRequest, PullOutcome};
use crate::switch::SwitchError;
use crate::transfer::{transfer, Delivery, TransferError};
use crate::vlan::{vlan_valid_id, VlanMangle, VLAN_ID_NATIVE, VLAN_ID_TRUNK};

/// Longest accepted debug name, in bytes.
pub const MAX_NAME_LEN: usize = vethswitch_stats::PORT_NAME_LEN - 1;

/// What a port is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortRole {
    /// Regular switched port.
    Switch,
    /// Mirror target; its transmit side is drained and discarded.
    Monitor,
}

/// The client-side endpoints of a port.
///
/// `notify` delivers a kick (descriptor state advanced in some direction);
/// `is_alive` reports whether the client endpoint still exists, polled by
/// the switch after a deletion notification.
pub trait PortClient {
    /// Deliver a kick to the client.
    fn notify(&self);

    /// Whether the client endpoint is still alive.
    fn is_alive(&self) -> bool;
}

/// Copy of a port's VLAN stance, taken while the source port is borrowed so
/// destination ports can pick their egress mangle afterwards.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VlanView {
    vid: u16,
}

impl VlanView {
    pub(crate) fn vid(self) -> u16 {
        self.vid
    }

    pub(crate) fn is_trunk(self) -> bool {
        self.vid == VLAN_ID_TRUNK
    }

    pub(crate) fn is_native(self) -> bool {
        self.vid == VLAN_ID_NATIVE
    }
}

fn vlan_bloom_hash(vid: u16) -> u32 {
    1 << (vid & 31)
}

/// A port: rings, VLAN stance, identity, counters.
pub struct Port {
    name: String,
    mac: MacAddr,
    role: PortRole,

    // Native port by default; access ports store their VID here, trunk
    // ports the TRUNK marker plus the id set and its bloom filter.
    vlan_id: u16,
    vlan_bloom: u32,
    vlan_ids: BTreeSet<u16>,

    mem: GuestMemoryMmap,
    rx: VirtQueue,
    tx: VirtQueue,
    needs_reset: bool,

    counters: PortCounters,
    client: Box<dyn PortClient>,
}

impl Port {
    /// Create a port over a client's memory region and ring layouts.
    ///
    /// The name is truncated to [`MAX_NAME_LEN`] bytes.  The port starts as
    /// a native port; call the VLAN setters before adding it to a switch.
    pub fn new(
        name: &str,
        mac: Option<MacAddr>,
        mem: GuestMemoryMmap,
        rx: QueueLayout,
        tx: QueueLayout,
        client: Box<dyn PortClient>,
    ) -> Self {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            name: name[..end].to_string(),
            mac: mac.unwrap_or(MacAddr::UNKNOWN),
            role: PortRole::Switch,
            vlan_id: VLAN_ID_NATIVE,
            vlan_bloom: 0,
            vlan_ids: BTreeSet::new(),
            mem,
            rx: VirtQueue::new(rx),
            tx: VirtQueue::new(tx),
            needs_reset: false,
            counters: PortCounters::default(),
            client,
        }
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port's MAC, `UNKNOWN` if none was assigned.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Switch or monitor.
    pub fn role(&self) -> PortRole {
        self.role
    }

    /// The port's packet and byte counters.
    pub fn counters(&self) -> &PortCounters {
        &self.counters
    }

    /// Whether the client endpoint is still alive.
    pub fn is_alive(&self) -> bool {
        self.client.is_alive()
    }

    /// Mark the device broken; its rings are not touched afterwards.
    pub(crate) fn flag_error(&mut self) {
        warn!("{}: device flagged in error", self.name);
        self.needs_reset = true;
    }

    /// Whether the device was flagged and awaits a client reset.
    pub fn device_needs_reset(&self) -> bool {
        self.needs_reset
    }

    // ── VLAN configuration ──────────────────────────────────────────────

    /// Configure as access port: member of exactly `vid`, no tags on the
    /// wire.
    ///
    /// # Errors
    ///
    /// Rejects ids outside 1..=4094 with [`SwitchError::InvalidVlanId`].
    pub fn set_vlan_access(&mut self, vid: u16) -> Result<(), SwitchError> {
        if !vlan_valid_id(vid) {
            return Err(SwitchError::InvalidVlanId { vid });
        }
        self.vlan_id = vid;
        self.vlan_bloom = 0;
        self.vlan_ids.clear();
        Ok(())
    }

    /// Configure as trunk port carrying the given VLANs, tagged on the wire.
    ///
    /// # Errors
    ///
    /// Rejects ids outside 1..=4094 with [`SwitchError::InvalidVlanId`].
    pub fn set_vlan_trunk(&mut self, ids: &[u16]) -> Result<(), SwitchError> {
        // Bloom filter for quick rejection of VLANs not on this port.
        let mut filter = 0u32;
        let mut set = BTreeSet::new();
        for &vid in ids {
            if !vlan_valid_id(vid) {
                return Err(SwitchError::InvalidVlanId { vid });
            }
            filter |= vlan_bloom_hash(vid);
            set.insert(vid);
        }
        self.vlan_id = VLAN_ID_TRUNK;
        self.vlan_bloom = filter;
        self.vlan_ids = set;
        Ok(())
    }

    /// Configure as monitor port.
    ///
    /// Modelled as a trunk with no members: mirrored traffic keeps or gains
    /// its tag so VLANs stay distinguishable, frames from native ports stay
    /// untagged.
    pub fn set_monitor(&mut self) {
        self.vlan_id = VLAN_ID_TRUNK;
        self.vlan_bloom = 0;
        self.vlan_ids.clear();
        self.role = PortRole::Monitor;
    }

    /// The port's own VLAN id (a pseudo id for native and trunk ports).
    pub fn vlan_id(&self) -> u16 {
        self.vlan_id
    }

    pub(crate) fn is_trunk(&self) -> bool {
        self.vlan_id == VLAN_ID_TRUNK
    }

    pub(crate) fn is_native(&self) -> bool {
        self.vlan_id == VLAN_ID_NATIVE
    }

    pub(crate) fn is_access(&self) -> bool {
        !self.is_trunk() && !self.is_native()
    }

    pub(crate) fn vlan_view(&self) -> VlanView {
        VlanView { vid: self.vlan_id }
    }

    /// Whether traffic of VLAN `id` is switched onto this port.
    ///
    /// `id` is the frame's VLAN or [`VLAN_ID_NATIVE`] for untagged traffic.
    /// The bloom probe only short-circuits misses; membership is decided by
    /// the id set.
    pub fn match_vlan(&self, id: u16) -> bool {
        // Native/access fast path.
        if id == self.vlan_id {
            return true;
        }
        if self.vlan_bloom & vlan_bloom_hash(id) == 0 {
            return false;
        }
        self.vlan_ids.contains(&id)
    }

    // ── Transmit side ───────────────────────────────────────────────────

    /// Whether the transmit ring has unconsumed descriptors.
    pub fn tx_work_pending(&self) -> bool {
        self.tx.is_ready() && self.tx.desc_avail(&self.mem)
    }

    /// Whether the client has published fresh receive descriptors.
    ///
    /// Deliveries happen inline during the sender's drain, so this is a
    /// readiness predicate only: a kick on a port with receive space but no
    /// transmit work needs no processing.
    pub fn rx_work_pending(&self) -> bool {
        self.rx.is_ready() && self.rx.desc_avail(&self.mem)
    }

    /// Pull one request from the transmit ring and apply the ingress tag
    /// policy: trunk ports only accept tags of their VLANs, access ports
    /// reject tagged frames outright (double-tagging), native ports accept
    /// anything.  Policy drops finish the head with zero bytes.
    ///
    /// # Errors
    ///
    /// Propagates [`DescriptorError`] for a malformed chain; the caller
    /// flags this device and aborts the drain.
    pub(crate) fn get_tx_request(&mut self) -> Result<Option<NetRequest>, DescriptorError> {
        let req = match NetRequest::from_next_available(&self.mem, &mut self.tx)? {
            PullOutcome::Empty => return Ok(None),
            PullOutcome::Invalid { head } => {
                self.counters.tx_dropped += 1;
                self.finish_tx_head(head);
                return Ok(None);
            }
            PullOutcome::Request(req) => req,
        };

        let rejected = if self.is_trunk() {
            !self.vlan_ids.contains(&req.vlan_id())
        } else {
            self.is_access() && req.has_vlan()
        };
        if rejected {
            debug!("{}: ingress policy drop (vlan {:#x})", self.name, req.vlan_id());
            self.counters.tx_dropped += 1;
            self.finish_request(req);
            return Ok(None);
        }
        Ok(Some(req))
    }

    /// Return a request's head to the client with zero bytes written.
    pub(crate) fn finish_request(&mut self, req: NetRequest) {
        self.finish_tx_head(req.head());
    }

    fn finish_tx_head(&mut self, head: u16) {
        if let Err(e) = self.tx.add_used(&self.mem, head, 0) {
            warn!("{}: failed to finish tx head {head}: {e}", self.name);
            self.needs_reset = true;
            return;
        }
        if self.tx.needs_kick(&self.mem) {
            self.client.notify();
        }
    }

    /// Account one pulled request on the transmit side.
    pub(crate) fn record_tx(&mut self, delivered: bool, bytes: u32) {
        if delivered {
            self.counters.tx_num += 1;
            self.counters.tx_bytes += u64::from(bytes);
        } else {
            self.counters.tx_dropped += 1;
        }
    }

    /// Finish every available transmit descriptor with zero bytes.
    ///
    /// Monitor ports are not allowed to send; their transmit ring is
    /// drained and discarded.
    pub(crate) fn drop_requests(&mut self) {
        if !self.tx.is_ready() {
            return;
        }
        if self.tx.desc_avail(&self.mem) {
            debug!("{}: dropping transmitted frames", self.name);
        }
        loop {
            match self.tx.pop_avail(&self.mem) {
                Ok(Some(head)) => {
                    self.counters.tx_dropped += 1;
                    self.finish_tx_head(head);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: bad descriptor while dropping: {e}", self.name);
                    self.flag_error();
                    break;
                }
            }
        }
    }

    // ── Receive side ────────────────────────────────────────────────────

    /// Pick the egress tag transform for a frame arriving from `src`.
    ///
    /// Trunk destinations want the frame tagged: add the source's VID
    /// unless the frame is already tagged (trunk source) or belongs to no
    /// VLAN (native source, monitor mirroring only).  Everyone else wants
    /// it untagged: strip when the source is a trunk.
    fn egress_mangle(&self, src: VlanView) -> VlanMangle {
        if self.is_trunk() {
            if !src.is_trunk() && !src.is_native() {
                VlanMangle::add(src.vid())
            } else {
                VlanMangle::none()
            }
        } else if src.is_trunk() {
            VlanMangle::remove()
        } else {
            VlanMangle::none()
        }
    }

    /// Deliver `req` into this port's receive ring.
    ///
    /// Destination-side faults are absorbed here: the device is flagged and
    /// the frame counts as dropped.
    ///
    /// # Errors
    ///
    /// Source-side faults propagate so the switch can flag the source
    /// device and abort the drain.
    pub(crate) fn handle_request(
        &mut self,
        src: VlanView,
        req: &NetRequest,
    ) -> Result<Delivery, DescriptorError> {
        if self.needs_reset {
            self.counters.rx_dropped += 1;
            return Ok(Delivery::Dropped);
        }
        let mangle = self.egress_mangle(src);
        match transfer(req, &self.mem, &mut self.rx, mangle) {
            Ok(Delivery::Delivered { bytes }) => {
                self.counters.rx_num += 1;
                self.counters.rx_bytes += u64::from(bytes);
                if self.rx.needs_kick(&self.mem) {
                    self.client.notify();
                }
                Ok(Delivery::Delivered { bytes })
            }
            Ok(Delivery::Dropped) => {
                self.counters.rx_dropped += 1;
                Ok(Delivery::Dropped)
            }
            Err(TransferError::Source(e)) => {
                self.counters.rx_dropped += 1;
                Err(e)
            }
            Err(TransferError::Dest(e)) => {
                warn!("{}: bad descriptor in receive ring: {e}", self.name);
                self.flag_error();
                self.counters.rx_dropped += 1;
                Ok(Delivery::Dropped)
            }
            Err(TransferError::HeaderSpace) => {
                warn!("{}: receive buffer too small for the header", self.name);
                self.counters.rx_dropped += 1;
                Ok(Delivery::Dropped)
            }
        }
    }

    // ── Notification management ─────────────────────────────────────────

    /// Ask the client not to kick while a drain is running.
    pub(crate) fn notify_disable_both(&mut self) {
        self.tx.disable_notify(&self.mem);
        self.rx.disable_notify(&self.mem);
    }

    /// Allow client kicks again.
    pub(crate) fn notify_enable_both(&mut self) {
        self.tx.enable_notify(&self.mem);
        self.rx.enable_notify(&self.mem);
    }

    /// Suspend outgoing kicks for batching.
    pub(crate) fn kick_disable_and_remember(&mut self) {
        self.tx.kick_disable_and_remember();
        self.rx.kick_disable_and_remember();
    }

    /// Resume kicks and emit at most one if any became due.
    pub(crate) fn kick_emit_and_enable(&mut self) {
        let pending =
            self.tx.kick_enable_get_pending() | self.rx.kick_enable_get_pending();
        if pending {
            self.client.notify();
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("role", &self.role)
            .field("vlan_id", &self.vlan_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{eth_frame, tagged_frame, test_port};

    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0xa];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0xb];

    #[test]
    fn name_is_truncated() {
        let (port, _h) = test_port("a-very-long-port-name-indeed", None);
        assert_eq!(port.name().len(), MAX_NAME_LEN);
        assert_eq!(port.name(), "a-very-long-port-na");
    }

    #[test]
    fn vlan_mode_predicates() {
        let (mut port, _h) = test_port("p", None);
        assert!(port.is_native());

        port.set_vlan_access(10).unwrap();
        assert!(port.is_access());
        assert_eq!(port.vlan_id(), 10);

        port.set_vlan_trunk(&[10, 20]).unwrap();
        assert!(port.is_trunk());

        port.set_monitor();
        assert!(port.is_trunk());
        assert_eq!(port.role(), PortRole::Monitor);
    }

    #[test]
    fn invalid_vlan_ids_rejected() {
        let (mut port, _h) = test_port("p", None);
        assert!(matches!(
            port.set_vlan_access(0),
            Err(SwitchError::InvalidVlanId { vid: 0 })
        ));
        assert!(matches!(
            port.set_vlan_access(4095),
            Err(SwitchError::InvalidVlanId { vid: 4095 })
        ));
        assert!(matches!(
            port.set_vlan_trunk(&[10, 5000]),
            Err(SwitchError::InvalidVlanId { vid: 5000 })
        ));
    }

    #[test]
    fn match_vlan_access_and_native() {
        let (mut port, _h) = test_port("p", None);
        assert!(port.match_vlan(VLAN_ID_NATIVE));
        assert!(!port.match_vlan(10));

        port.set_vlan_access(10).unwrap();
        assert!(port.match_vlan(10));
        assert!(!port.match_vlan(20));
        assert!(!port.match_vlan(VLAN_ID_NATIVE));
    }

    #[test]
    fn match_vlan_trunk_uses_member_set() {
        let (mut port, _h) = test_port("p", None);
        port.set_vlan_trunk(&[10, 20]).unwrap();
        assert!(port.match_vlan(10));
        assert!(port.match_vlan(20));
        // 42 ≡ 10 (mod 32): bloom collision, the set must still reject it.
        assert!(!port.match_vlan(42));
        assert!(!port.match_vlan(30));
        assert!(!port.match_vlan(VLAN_ID_NATIVE));
    }

    #[test]
    fn native_ingress_accepts_tagged_and_untagged() {
        let (mut port, mut h) = test_port("p", None);
        h.send(&eth_frame(MAC_B, MAC_A, &[1; 40]));
        h.send(&tagged_frame(MAC_B, MAC_A, 10, &[2; 40]));
        assert!(port.get_tx_request().unwrap().is_some());
        let req = port.get_tx_request().unwrap().unwrap();
        assert_eq!(req.vlan_id(), 10);
    }

    #[test]
    fn access_ingress_rejects_tagged() {
        let (mut port, mut h) = test_port("p", None);
        port.set_vlan_access(10).unwrap();
        h.send(&tagged_frame(MAC_B, MAC_A, 10, &[2; 40]));

        assert!(port.get_tx_request().unwrap().is_none());
        // The head was finished with zero bytes and counted as dropped.
        assert_eq!(h.tx.used_entries().len(), 1);
        assert_eq!(port.counters().tx_dropped, 1);
    }

    #[test]
    fn trunk_ingress_rejects_untagged_and_foreign_vlans() {
        let (mut port, mut h) = test_port("p", None);
        port.set_vlan_trunk(&[10]).unwrap();
        h.send(&eth_frame(MAC_B, MAC_A, &[1; 40]));
        h.send(&tagged_frame(MAC_B, MAC_A, 20, &[2; 40]));
        h.send(&tagged_frame(MAC_B, MAC_A, 10, &[3; 40]));

        assert!(port.get_tx_request().unwrap().is_none());
        assert!(port.get_tx_request().unwrap().is_none());
        let req = port.get_tx_request().unwrap().unwrap();
        assert_eq!(req.vlan_id(), 10);
        assert_eq!(port.counters().tx_dropped, 2);
    }

    #[test]
    fn egress_mangle_selection() {
        let (mut trunk, _h1) = test_port("t", None);
        trunk.set_vlan_trunk(&[10]).unwrap();
        let (mut access, _h2) = test_port("a", None);
        access.set_vlan_access(10).unwrap();
        let (native, _h3) = test_port("n", None);
        let (mut monitor, _h4) = test_port("m", None);
        monitor.set_monitor();

        // Access→trunk adds the tag, trunk→non-trunk removes it,
        // everything else passes through.
        assert!(trunk.egress_mangle(access.vlan_view()).is_add());
        assert!(trunk.egress_mangle(trunk.vlan_view()).is_none_transform());
        assert!(trunk.egress_mangle(native.vlan_view()).is_none_transform());
        assert!(access.egress_mangle(trunk.vlan_view()).is_remove());
        assert!(access.egress_mangle(native.vlan_view()).is_none_transform());
        assert!(native.egress_mangle(access.vlan_view()).is_none_transform());
        assert!(monitor.egress_mangle(access.vlan_view()).is_add());
        assert!(monitor.egress_mangle(native.vlan_view()).is_none_transform());
    }

    #[test]
    fn drop_requests_finishes_everything() {
        let (mut port, mut h) = test_port("m", None);
        h.send(&eth_frame(MAC_B, MAC_A, &[1; 40]));
        h.send(&eth_frame(MAC_A, MAC_B, &[2; 40]));

        port.drop_requests();
        let used = h.tx.used_entries();
        assert_eq!(used.len(), 2);
        assert!(used.iter().all(|&(_, len)| len == 0));
        assert_eq!(port.counters().tx_dropped, 2);
        assert!(!port.tx_work_pending());
    }

    #[test]
    fn delivery_updates_counters_and_kicks() {
        let (mut src_port, mut src_h) = test_port("src", None);
        let (mut dst_port, mut dst_h) = test_port("dst", None);
        let frame = eth_frame(MAC_B, MAC_A, &[5; 60]);
        src_h.send(&frame);
        dst_h.add_rx_chain(&[2048]);

        let req = src_port.get_tx_request().unwrap().unwrap();
        let out = dst_port.handle_request(src_port.vlan_view(), &req).unwrap();
        assert!(matches!(out, Delivery::Delivered { .. }));

        assert_eq!(dst_port.counters().rx_num, 1);
        assert_eq!(dst_port.counters().rx_bytes, frame.len() as u64);
        assert_eq!(dst_h.kicks(), 1);
        assert_eq!(dst_h.frames(), vec![frame]);
    }

    #[test]
    fn work_pending_predicates() {
        let (port, mut h) = test_port("p", None);
        assert!(!port.tx_work_pending());
        assert!(!port.rx_work_pending());
        h.send(&eth_frame(MAC_B, MAC_A, &[1; 40]));
        h.add_rx_chain(&[2048]);
        assert!(port.tx_work_pending());
        assert!(port.rx_work_pending());
    }

    #[test]
    fn ring_full_counts_rx_dropped() {
        let (mut src_port, mut src_h) = test_port("src", None);
        let (mut dst_port, dst_h) = test_port("dst", None);
        src_h.send(&eth_frame(MAC_B, MAC_A, &[5; 60]));

        let req = src_port.get_tx_request().unwrap().unwrap();
        let out = dst_port.handle_request(src_port.vlan_view(), &req).unwrap();
        assert_eq!(out, Delivery::Dropped);
        assert_eq!(dst_port.counters().rx_dropped, 1);
        assert_eq!(dst_h.kicks(), 0);
    }

    #[test]
    fn flagged_port_is_not_touched() {
        let (mut src_port, mut src_h) = test_port("src", None);
        let (mut dst_port, mut dst_h) = test_port("dst", None);
        src_h.send(&eth_frame(MAC_B, MAC_A, &[5; 60]));
        dst_h.add_rx_chain(&[2048]);

        dst_port.flag_error();
        let req = src_port.get_tx_request().unwrap().unwrap();
        let out = dst_port.handle_request(src_port.vlan_view(), &req).unwrap();
        assert_eq!(out, Delivery::Dropped);
        assert!(dst_h.rx.used_entries().is_empty());
    }

    #[test]
    fn kick_batching_emits_once() {
        let (mut dst_port, mut dst_h) = test_port("dst", None);
        let (mut src_port, mut src_h) = test_port("src", None);
        for i in 0..3u8 {
            src_h.send(&eth_frame(MAC_B, MAC_A, &[i; 40]));
            dst_h.add_rx_chain(&[2048]);
        }

        dst_port.kick_disable_and_remember();
        for _ in 0..3 {
            let req = src_port.get_tx_request().unwrap().unwrap();
            dst_port.handle_request(src_port.vlan_view(), &req).unwrap();
            src_port.finish_request(req);
        }
        assert_eq!(dst_h.kicks(), 0);
        dst_port.kick_emit_and_enable();
        assert_eq!(dst_h.kicks(), 1);
        assert_eq!(dst_h.frames().len(), 3);
    }
}
