//! The switch: port set, learning table, forwarding loop.
//!
//! Ports are owned by the switch and addressed through [`PortId`] handles, a
//! slot index plus a generation counter bumped when a slot's port is
//! destroyed, so a handle can never alias a successor port.  The monitor
//! port lives next to the slot array: it is no forwarding destination and
//! only receives mirrored copies.
//!
//! Everything here runs on one event-loop task.  `drain` is entered when a
//! client kick arrives, `check_ports` after an endpoint-deletion
//! notification; neither suspends, and the single-threaded discipline is the
//! only lock.

use std::sync::atomic::{fence, Ordering};

use log::{debug, info, warn};
use thiserror::Error;

use vethswitch_stats::StatsBlock;

use crate::filter::MirrorFilter;
use crate::mac_table::MacTable;
use crate::port::{Port, PortRole, VlanView};
use crate::queue::DescriptorError;
use crate::request::NetRequest;
use crate::transfer::Delivery;

/// Bytes of a frame shown to the mirror filter.
const FILTER_PEEK: usize = 64;

/// Slot index reserved for the monitor port.
const MONITOR_INDEX: u32 = u32::MAX;

// ═══════════════════════════════════════════════════════════════════════
//  Configuration and errors
// ═══════════════════════════════════════════════════════════════════════

/// Switch-wide limits, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct SwitchConfig {
    /// Number of port slots.
    pub max_ports: usize,
    /// Capacity of the MAC learning table.
    pub mac_table_size: usize,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_ports: 256,
            mac_table_size: crate::mac_table::DEFAULT_CAPACITY,
        }
    }
}

/// A port configuration was rejected; no switch state was changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchError {
    /// Another port already owns the MAC.
    #[error("MAC address {mac} already in use by port '{port}'")]
    DuplicateMac {
        /// The offending address.
        mac: crate::mac::MacAddr,
        /// Name of the port holding it.
        port: String,
    },

    /// All port slots are taken.
    #[error("no free port slot available")]
    NoFreeSlot,

    /// A monitor port is already registered.
    #[error("monitor port '{port}' already registered")]
    MonitorExists {
        /// Name of the existing monitor.
        port: String,
    },

    /// A VLAN id outside the configurable range was requested.
    #[error("VLAN id {vid} outside 1..=4094")]
    InvalidVlanId {
        /// The offending id.
        vid: u16,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Port handles
// ═══════════════════════════════════════════════════════════════════════

/// Stable handle to a port: slot index plus slot generation.
///
/// Handles to destroyed ports go stale rather than dangling; the learning
/// table and embedders hold these instead of references.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PortId {
    index: u32,
    gen: u32,
}

impl PortId {
    /// Slot index; the monitor port reports [`u32::MAX`].
    pub fn index(&self) -> u32 {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(index: u32, gen: u32) -> Self {
        Self { index, gen }
    }
}

#[derive(Debug, Default)]
struct Slot {
    port: Option<Port>,
    gen: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct ForwardSummary {
    delivered: u32,
    bytes: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Switch
// ═══════════════════════════════════════════════════════════════════════

/// The virtual Ethernet switch.
pub struct Switch {
    slots: Vec<Slot>,
    max_used: usize,
    monitor: Option<Port>,
    monitor_gen: u32,
    mac_table: MacTable,
    filter: Option<Box<dyn MirrorFilter>>,
}

impl Switch {
    /// Create a switch per `config`.
    pub fn new(config: SwitchConfig) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(config.max_ports, Slot::default);
        Self {
            slots,
            max_used: 0,
            monitor: None,
            monitor_gen: 0,
            mac_table: MacTable::new(config.mac_table_size),
            filter: None,
        }
    }

    /// Install the mirror filter hook.
    pub fn set_mirror_filter(&mut self, filter: Box<dyn MirrorFilter>) {
        self.filter = Some(filter);
    }

    /// The learning table, for inspection.
    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }

    /// Look up a port by handle; `None` when the handle went stale.
    pub fn port(&self, id: PortId) -> Option<&Port> {
        if id.index == MONITOR_INDEX {
            return self
                .monitor
                .as_ref()
                .filter(|_| id.gen == self.monitor_gen);
        }
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.port.as_ref()
    }

    fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        if id.index == MONITOR_INDEX {
            let gen = self.monitor_gen;
            return self.monitor.as_mut().filter(|_| id.gen == gen);
        }
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.port.as_mut()
    }

    fn slot_id(&self, index: usize) -> PortId {
        PortId {
            index: index as u32,
            gen: self.slots[index].gen,
        }
    }

    /// Number of live switched ports.
    pub fn num_ports(&self) -> usize {
        self.slots.iter().filter(|s| s.port.is_some()).count()
    }

    /// The monitor port, if one is registered.
    pub fn monitor(&self) -> Option<&Port> {
        self.monitor.as_ref()
    }

    // ── Port registration ───────────────────────────────────────────────

    fn check_duplicate_mac(&self, port: &Port) -> Result<(), SwitchError> {
        let mac = port.mac();
        if mac.is_unknown() {
            return Ok(());
        }
        let holder = self
            .slots
            .iter()
            .filter_map(|s| s.port.as_ref())
            .chain(self.monitor.as_ref())
            .find(|p| p.mac() == mac);
        match holder {
            Some(p) => Err(SwitchError::DuplicateMac {
                mac,
                port: p.name().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Add a switched port.
    ///
    /// # Errors
    ///
    /// [`SwitchError::DuplicateMac`] if the port's MAC is already owned by
    /// another port, [`SwitchError::NoFreeSlot`] if every slot is taken.
    pub fn add_port(&mut self, port: Port) -> Result<PortId, SwitchError> {
        self.check_duplicate_mac(&port)?;
        let index = self
            .slots
            .iter()
            .position(|s| s.port.is_none())
            .ok_or(SwitchError::NoFreeSlot)?;
        info!("adding port '{}' at slot {index}", port.name());
        self.slots[index].port = Some(port);
        if self.max_used == index {
            self.max_used += 1;
        }
        Ok(self.slot_id(index))
    }

    /// Add the monitor port; it receives mirrored copies of all forwarded
    /// traffic and never sources any.
    ///
    /// # Errors
    ///
    /// [`SwitchError::MonitorExists`] if a monitor is already registered,
    /// [`SwitchError::DuplicateMac`] as for [`add_port`](Self::add_port).
    pub fn add_monitor_port(&mut self, mut port: Port) -> Result<PortId, SwitchError> {
        if let Some(existing) = &self.monitor {
            return Err(SwitchError::MonitorExists {
                port: existing.name().to_string(),
            });
        }
        self.check_duplicate_mac(&port)?;
        port.set_monitor();
        info!("adding monitor port '{}'", port.name());
        self.monitor = Some(port);
        Ok(PortId {
            index: MONITOR_INDEX,
            gen: self.monitor_gen,
        })
    }

    // ── Liveness ────────────────────────────────────────────────────────

    /// Destroy every port whose client endpoint has gone.
    ///
    /// Invoked after an endpoint-deletion notification.  Learning-table
    /// entries of removed ports are flushed so referential integrity holds.
    pub fn check_ports(&mut self) {
        for index in 0..self.slots.len() {
            let gone = self.slots[index]
                .port
                .as_ref()
                .is_some_and(|p| !p.is_alive());
            if !gone {
                continue;
            }
            let id = self.slot_id(index);
            if let Some(port) = self.slots[index].port.take() {
                info!("client on port '{}' has gone, removing", port.name());
            }
            self.slots[index].gen += 1;
            if index + 1 == self.max_used {
                self.max_used -= 1;
            }
            self.mac_table.flush(id);
        }

        if self.monitor.as_ref().is_some_and(|p| !p.is_alive()) {
            if let Some(port) = self.monitor.take() {
                info!("monitor client '{}' has gone, removing", port.name());
            }
            self.monitor_gen += 1;
        }
    }

    // ── Forwarding ──────────────────────────────────────────────────────

    /// Process a client kick on `id`: drain the port's transmit ring and
    /// forward every frame.
    ///
    /// Client notifications are batched: while the pass runs, kicks are
    /// suppressed on all ports and each destination receives at most one
    /// afterwards.  The closing barriers plus the re-check of pending work
    /// close the race against a client submitting right when notifications
    /// are re-enabled.
    pub fn drain(&mut self, id: PortId) {
        if id.index == MONITOR_INDEX {
            self.drain_monitor(id);
            return;
        }
        if self.port(id).is_none() {
            debug!("kick for unknown or stale port {id:?}");
            return;
        }
        let is_monitor_role = self
            .port(id)
            .map_or(false, |p| p.role() == PortRole::Monitor);
        if is_monitor_role {
            self.drain_monitor(id);
            return;
        }

        loop {
            if let Some(port) = self.port_mut(id) {
                port.notify_disable_both();
            }
            self.kick_disable_all();

            let mut source_fault = false;
            while self.port(id).map_or(false, |p| p.tx_work_pending()) {
                if let Err(e) = self.process_one_tx(id) {
                    warn!("port {}: bad source descriptor: {e}", id.index);
                    if let Some(port) = self.port_mut(id) {
                        port.flag_error();
                    }
                    source_fault = true;
                    break;
                }
            }

            self.kick_emit_enable_all();
            if source_fault {
                return;
            }
            let Some(port) = self.port_mut(id) else {
                return;
            };
            if port.device_needs_reset() {
                return;
            }
            port.notify_enable_both();

            // Publish our used-ring updates, then observe any submission
            // racing the notify re-enable; the re-check below closes the
            // window.
            fence(Ordering::Release);
            fence(Ordering::Acquire);

            if !port.tx_work_pending() {
                break;
            }
        }
    }

    /// Monitor ports never forward; their transmits are drained and
    /// discarded.
    fn drain_monitor(&mut self, id: PortId) {
        loop {
            let Some(port) = self.port_mut(id) else {
                debug!("kick for unknown or stale monitor {id:?}");
                return;
            };
            port.notify_disable_both();
            port.drop_requests();
            port.notify_enable_both();

            fence(Ordering::Release);
            fence(Ordering::Acquire);

            if !port.tx_work_pending() {
                break;
            }
        }
    }

    /// Pull and forward one frame from `id`'s transmit ring.
    fn process_one_tx(&mut self, id: PortId) -> Result<(), DescriptorError> {
        let (req, src_vlan) = {
            let Some(port) = self.port_mut(id) else {
                return Ok(());
            };
            match port.get_tx_request()? {
                Some(req) => {
                    let view = port.vlan_view();
                    (req, view)
                }
                None => return Ok(()),
            }
        };

        let src_mac = req.src_mac();
        if !src_mac.is_broadcast() && !src_mac.is_unknown() {
            self.mac_table.learn(src_mac, id);
        }
        let vid = if req.has_vlan() {
            req.vlan_id()
        } else {
            src_vlan.vid()
        };

        let forwarded = self.forward(id, &req, src_vlan, vid);
        let summary = forwarded.as_ref().copied().unwrap_or_default();
        if let Some(port) = self.port_mut(id) {
            port.record_tx(summary.delivered > 0, summary.bytes);
            port.finish_request(req);
        }
        forwarded.map(|_| ())
    }

    /// The forwarding decision for one frame.
    ///
    /// Unicast to a learned destination goes to that port alone; broadcast
    /// and unknown destinations flood every port in the frame's VLAN.  A
    /// frame never returns to its source port, even when the learned
    /// destination points there: another switch may have sent it to us not
    /// knowing a better route.
    fn forward(
        &mut self,
        src: PortId,
        req: &NetRequest,
        src_vlan: VlanView,
        vid: u16,
    ) -> Result<ForwardSummary, DescriptorError> {
        let mut summary = ForwardSummary::default();
        let dst = req.dst_mac();

        if !dst.is_broadcast() {
            if let Some(target) = self.mac_table.lookup(dst) {
                if target != src && self.port(target).is_some_and(|p| p.match_vlan(vid)) {
                    self.deliver(target, src_vlan, req, &mut summary)?;
                    self.mirror(src_vlan, req)?;
                }
                return Ok(summary);
            }
        }

        // Broadcast or unknown destination: flood the VLAN.
        for index in 0..self.max_used {
            let target = self.slot_id(index);
            if target == src {
                continue;
            }
            if self.port(target).is_some_and(|p| p.match_vlan(vid)) {
                self.deliver(target, src_vlan, req, &mut summary)?;
            }
        }
        self.mirror(src_vlan, req)?;
        Ok(summary)
    }

    fn deliver(
        &mut self,
        target: PortId,
        src_vlan: VlanView,
        req: &NetRequest,
        summary: &mut ForwardSummary,
    ) -> Result<(), DescriptorError> {
        let Some(port) = self.port_mut(target) else {
            return Ok(());
        };
        if let Delivery::Delivered { bytes } = port.handle_request(src_vlan, req)? {
            summary.delivered += 1;
            if summary.bytes == 0 {
                summary.bytes = bytes;
            }
        }
        Ok(())
    }

    /// Send the monitor its copy, unless the filter objects.
    fn mirror(&mut self, src_vlan: VlanView, req: &NetRequest) -> Result<(), DescriptorError> {
        if self.monitor.is_none() {
            return Ok(());
        }
        if let Some(filter) = &self.filter {
            let mut buf = [0u8; FILTER_PEEK];
            if filter.exclude(req.peek(&mut buf)) {
                return Ok(());
            }
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.handle_request(src_vlan, req)?;
        }
        Ok(())
    }

    // ── Kick batching across the port set ───────────────────────────────

    fn kick_disable_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(port) = slot.port.as_mut() {
                port.kick_disable_and_remember();
            }
        }
    }

    fn kick_emit_enable_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(port) = slot.port.as_mut() {
                port.kick_emit_and_enable();
            }
        }
    }

    // ── Statistics export ───────────────────────────────────────────────

    /// Publish the current counters of every live port into `block`.
    ///
    /// Records are rebuilt from scratch, so the block's age advances with
    /// every export and readers re-scan the record set.
    pub fn export_stats(&self, block: &mut StatsBlock) {
        for idx in 0..block.max_ports() {
            block.retire(idx);
        }
        for port in self
            .slots
            .iter()
            .filter_map(|s| s.port.as_ref())
            .chain(self.monitor.as_ref())
        {
            if let Some(idx) = block.allocate(port.name(), port.mac().to_bytes()) {
                if let Some(counters) = block.counters_mut(idx) {
                    *counters = *port.counters();
                }
            }
        }
    }
}
