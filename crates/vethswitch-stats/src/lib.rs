//! Shared statistics block layout for the vethswitch switch.
//!
//! The switch keeps six counters per port and publishes them, together with
//! the port name and MAC address, in a flat block that an external reader can
//! map read-only.  This crate owns the layout so switch and readers agree on
//! it without depending on each other.
//!
//! All record types are `#[repr(C)]` with explicit padding; the block is a
//! header followed by `max_ports` fixed-size records.

// ═══════════════════════════════════════════════════════════════════════
//  Record layout
// ═══════════════════════════════════════════════════════════════════════

/// Space reserved for a port name, including the NUL terminator.
pub const PORT_NAME_LEN: usize = 20;

/// Per-direction packet and byte counters for one port.
///
/// `tx` counts frames the port's client transmitted into the switch, `rx`
/// frames the switch delivered into the port's receive ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortCounters {
    /// Frames accepted from the transmit ring and forwarded.
    pub tx_num: u64,
    /// Frames taken from the transmit ring but not forwarded anywhere.
    pub tx_dropped: u64,
    /// Payload bytes of forwarded frames.
    pub tx_bytes: u64,
    /// Frames delivered into the receive ring.
    pub rx_num: u64,
    /// Frames that could not be delivered into the receive ring.
    pub rx_dropped: u64,
    /// Payload bytes delivered into the receive ring.
    pub rx_bytes: u64,
}

/// One published record: counters plus port identity.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PortRecord {
    /// The port's counters.
    pub counters: PortCounters,
    /// MAC address of the port, all zero if none was assigned.
    pub mac: [u8; 6],
    /// NUL-terminated port name.
    pub name: [u8; PORT_NAME_LEN],
    /// 1 while the record describes a live port, 0 otherwise.
    pub in_use: u8,
    _reserved: [u8; 5],
}

impl Default for PortRecord {
    fn default() -> Self {
        Self {
            counters: PortCounters::default(),
            mac: [0; 6],
            name: [0; PORT_NAME_LEN],
            in_use: 0,
            _reserved: [0; 5],
        }
    }
}

impl PortRecord {
    /// The record's name as UTF-8, up to the first NUL.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(PORT_NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Block
// ═══════════════════════════════════════════════════════════════════════

/// The statistics block: a generation counter plus one record per port slot.
///
/// `age` increases on every structural change (record allocated or retired)
/// so a reader polling the block can detect port churn.
#[derive(Debug)]
pub struct StatsBlock {
    age: u64,
    records: Vec<PortRecord>,
}

impl StatsBlock {
    /// Create a block with room for `max_ports` records.
    pub fn new(max_ports: usize) -> Self {
        Self {
            age: 0,
            records: vec![PortRecord::default(); max_ports],
        }
    }

    /// Generation counter; bumped on allocate and retire.
    pub fn age(&self) -> u64 {
        self.age
    }

    /// Number of record slots.
    pub fn max_ports(&self) -> usize {
        self.records.len()
    }

    /// Claim a free record for a port.
    ///
    /// Returns the record index, or `None` if every slot is in use.  The name
    /// is truncated to [`PORT_NAME_LEN`]` - 1` bytes.
    pub fn allocate(&mut self, name: &str, mac: [u8; 6]) -> Option<usize> {
        let idx = self.records.iter().position(|r| r.in_use == 0)?;
        let rec = &mut self.records[idx];
        *rec = PortRecord::default();
        let n = name.len().min(PORT_NAME_LEN - 1);
        rec.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        rec.mac = mac;
        rec.in_use = 1;
        self.age += 1;
        Some(idx)
    }

    /// Release a record; its slot becomes reusable.
    pub fn retire(&mut self, idx: usize) {
        if let Some(rec) = self.records.get_mut(idx) {
            if rec.in_use != 0 {
                rec.in_use = 0;
                self.age += 1;
            }
        }
    }

    /// Mutable access to a record's counters, `None` if the slot is free.
    pub fn counters_mut(&mut self, idx: usize) -> Option<&mut PortCounters> {
        match self.records.get_mut(idx) {
            Some(rec) if rec.in_use != 0 => Some(&mut rec.counters),
            _ => None,
        }
    }

    /// All records, free slots included.
    pub fn records(&self) -> &[PortRecord] {
        &self.records
    }

    /// Iterate over the in-use records.
    pub fn live_records(&self) -> impl Iterator<Item = (usize, &PortRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_use != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_stable() {
        // Readers map the block from foreign processes; the sizes are ABI.
        assert_eq!(std::mem::size_of::<PortCounters>(), 48);
        assert_eq!(std::mem::size_of::<PortRecord>(), 80);
        assert_eq!(std::mem::align_of::<PortRecord>(), 8);
    }

    #[test]
    fn allocate_and_retire() {
        let mut block = StatsBlock::new(2);
        assert_eq!(block.age(), 0);

        let a = block.allocate("p0", [2, 0, 0, 0, 0, 1]).unwrap();
        let b = block.allocate("p1", [2, 0, 0, 0, 0, 2]).unwrap();
        assert_ne!(a, b);
        assert_eq!(block.age(), 2);
        assert!(block.allocate("p2", [0; 6]).is_none());

        block.retire(a);
        assert_eq!(block.age(), 3);
        let c = block.allocate("p2", [2, 0, 0, 0, 0, 3]).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn name_truncated_and_terminated() {
        let mut block = StatsBlock::new(1);
        let long = "a-port-name-that-is-way-too-long";
        let idx = block.allocate(long, [0; 6]).unwrap();
        let rec = &block.records()[idx];
        assert_eq!(rec.name_str().len(), PORT_NAME_LEN - 1);
        assert_eq!(rec.name[PORT_NAME_LEN - 1], 0);
        assert!(long.starts_with(rec.name_str()));
    }

    #[test]
    fn counters_update() {
        let mut block = StatsBlock::new(1);
        let idx = block.allocate("p0", [0; 6]).unwrap();
        block.counters_mut(idx).unwrap().tx_num = 7;
        assert_eq!(block.records()[idx].counters.tx_num, 7);
        block.retire(idx);
        assert!(block.counters_mut(idx).is_none());
    }

    #[test]
    fn live_records_skip_free_slots() {
        let mut block = StatsBlock::new(3);
        block.allocate("p0", [0; 6]).unwrap();
        let b = block.allocate("p1", [0; 6]).unwrap();
        block.allocate("p2", [0; 6]).unwrap();
        block.retire(b);
        let names: Vec<_> = block.live_records().map(|(_, r)| r.name_str().to_string()).collect();
        assert_eq!(names, ["p0", "p2"]);
    }
}
