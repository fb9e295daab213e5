//! The MAC learning table.
//!
//! The switch sees one MAC per port for plain clients, but a client may also
//! be a software bridge sending with many source addresses, so the table
//! keeps a 1:n association from ports to MACs.  Growth is bounded: entries
//! live in a fixed slot array replaced in strict round-robin order, with a
//! hash index on top for constant-time lookup.

use std::collections::HashMap;

use log::debug;

use crate::mac::MacAddr;
use crate::switch::PortId;

/// Default number of table slots.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug)]
struct Entry {
    mac: MacAddr,
    port: Option<PortId>,
}

impl Entry {
    const EMPTY: Entry = Entry {
        mac: MacAddr::UNKNOWN,
        port: None,
    };
}

/// Bounded MAC-to-port map with round-robin replacement.
#[derive(Debug)]
pub struct MacTable {
    index: HashMap<MacAddr, usize>,
    slots: Vec<Entry>,
    rr: usize,
}

impl MacTable {
    /// Create a table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: vec![Entry::EMPTY; capacity],
            rr: 0,
        }
    }

    /// Find the port a MAC address was last seen on.
    pub fn lookup(&self, mac: MacAddr) -> Option<PortId> {
        self.index.get(&mac).and_then(|&slot| self.slots[slot].port)
    }

    /// Learn a MAC address.
    ///
    /// A known address only has its port updated, so clients moving between
    /// ports are followed without disturbing the replacement order.  A new
    /// address claims the slot at the round-robin cursor, evicting whatever
    /// lived there, and advances the cursor.
    pub fn learn(&mut self, mac: MacAddr, port: PortId) {
        if let Some(&slot) = self.index.get(&mac) {
            if self.slots[slot].port != Some(port) {
                debug!("moved {mac} -> {port:?}");
            }
            self.slots[slot].port = Some(port);
            return;
        }

        let slot = self.rr;
        if self.slots[slot].port.is_some() {
            self.index.remove(&self.slots[slot].mac);
        }
        self.slots[slot] = Entry {
            mac,
            port: Some(port),
        };
        self.index.insert(mac, slot);
        self.rr = (self.rr + 1) % self.slots.len();
        debug!("learned {mac} -> {port:?}");
    }

    /// Remove every entry pointing at `port`.
    ///
    /// The association is 1:n, so the whole slot array is scanned.  Used
    /// slots are cleared in place; the round-robin cursor is not moved.
    pub fn flush(&mut self, port: PortId) {
        for slot in &mut self.slots {
            if slot.port == Some(port) {
                self.index.remove(&slot.mac);
                *slot = Entry::EMPTY;
            }
        }
    }

    /// Number of learned addresses.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no address has been learned.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Table capacity in slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for MacTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
