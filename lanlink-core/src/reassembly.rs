//! Fragment reassembly for multi-PDU messages, keyed by (source, msg_id).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::frame::MacAddr;
use crate::pdu::{Pdu, PduType};

/// Result of feeding one fragment into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// All fragments present; the concatenated payload in index order.
    Complete(Vec<u8>),
    /// Stored (or duplicate); more fragments outstanding.
    Pending,
    /// Invalid fragment. A header inconsistent with the slot invalidates
    /// the whole slot.
    Rejected,
}

struct Slot {
    ptype: PduType,
    total: u16,
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    first_rx: Instant,
}

impl Slot {
    fn new(ptype: PduType, total: u16, now: Instant) -> Slot {
        Slot {
            ptype,
            total,
            fragments: vec![None; total as usize],
            received: 0,
            first_rx: now,
        }
    }
}

/// Reassembly slots for in-flight fragmented messages.
#[derive(Default)]
pub struct ReassemblyTable {
    slots: HashMap<(MacAddr, u32), Slot>,
}

impl ReassemblyTable {
    pub fn new() -> ReassemblyTable {
        ReassemblyTable::default()
    }

    /// Feed one fragment. All fragments of a message must agree on type and
    /// `frag_total`; a mismatch drops the slot.
    pub fn accept(&mut self, src: MacAddr, pdu: Pdu, now: Instant) -> Feed {
        if pdu.frag_total == 0 || pdu.frag_index >= pdu.frag_total {
            return Feed::Rejected;
        }
        let key = (src, pdu.msg_id);
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Slot::new(pdu.ptype, pdu.frag_total, now));
        if slot.ptype != pdu.ptype || slot.total != pdu.frag_total {
            self.slots.remove(&key);
            return Feed::Rejected;
        }
        let idx = pdu.frag_index as usize;
        if slot.fragments[idx].is_some() {
            return Feed::Pending; // duplicate
        }
        slot.fragments[idx] = Some(pdu.payload);
        slot.received += 1;
        if slot.received < slot.total {
            return Feed::Pending;
        }
        let slot = match self.slots.remove(&key) {
            Some(slot) => slot,
            None => return Feed::Rejected,
        };
        let mut assembled = Vec::new();
        for fragment in slot.fragments.into_iter().flatten() {
            assembled.extend_from_slice(&fragment);
        }
        Feed::Complete(assembled)
    }

    /// Evict slots whose first fragment is older than `timeout`. Returns the
    /// number of slots dropped.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.duration_since(slot.first_rx) < timeout);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr([b; 6])
    }

    fn fragment(msg_id: u32, index: u16, total: u16, payload: &[u8]) -> Pdu {
        Pdu {
            ptype: PduType::Text,
            flags: 0,
            msg_id,
            frag_index: index,
            frag_total: total,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        let result = table.accept(mac(1), fragment(7, 0, 1, b"hola"), now);
        assert_eq!(result, Feed::Complete(b"hola".to_vec()));
        assert!(table.is_empty());
    }

    #[test]
    fn out_of_order_fragments_reassemble_in_index_order() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 2, 3, b"c"), now), Feed::Pending);
        assert_eq!(table.accept(mac(1), fragment(7, 0, 3, b"a"), now), Feed::Pending);
        assert_eq!(
            table.accept(mac(1), fragment(7, 1, 3, b"b"), now),
            Feed::Complete(b"abc".to_vec())
        );
    }

    #[test]
    fn assembled_length_is_sum_of_fragment_lengths() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        table.accept(mac(1), fragment(9, 0, 2, &[1u8; 100]), now);
        if let Feed::Complete(bytes) = table.accept(mac(1), fragment(9, 1, 2, &[2u8; 57]), now) {
            assert_eq!(bytes.len(), 157);
        } else {
            panic!("expected completion");
        }
    }

    #[test]
    fn duplicate_fragment_ignored() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 0, 2, b"a"), now), Feed::Pending);
        assert_eq!(table.accept(mac(1), fragment(7, 0, 2, b"x"), now), Feed::Pending);
        assert_eq!(
            table.accept(mac(1), fragment(7, 1, 2, b"b"), now),
            Feed::Complete(b"ab".to_vec())
        );
    }

    #[test]
    fn index_out_of_range_rejected() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 3, 3, b"x"), now), Feed::Rejected);
        assert_eq!(table.accept(mac(1), fragment(7, 0, 0, b"x"), now), Feed::Rejected);
    }

    #[test]
    fn mismatched_total_invalidates_slot() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 0, 3, b"a"), now), Feed::Pending);
        assert_eq!(table.accept(mac(1), fragment(7, 1, 4, b"b"), now), Feed::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn mismatched_type_invalidates_slot() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 0, 2, b"a"), now), Feed::Pending);
        let mut other = fragment(7, 1, 2, b"b");
        other.ptype = PduType::FileData;
        assert_eq!(table.accept(mac(1), other, now), Feed::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn same_msg_id_from_different_sources_kept_apart() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        assert_eq!(table.accept(mac(1), fragment(7, 0, 2, b"a"), now), Feed::Pending);
        assert_eq!(
            table.accept(mac(2), fragment(7, 0, 1, b"z"), now),
            Feed::Complete(b"z".to_vec())
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_evicts_stale_slots() {
        let mut table = ReassemblyTable::new();
        let t0 = Instant::now();
        table.accept(mac(1), fragment(7, 0, 2, b"a"), t0);
        table.accept(mac(2), fragment(8, 0, 2, b"b"), t0 + Duration::from_secs(20));
        assert_eq!(table.sweep(t0 + Duration::from_secs(30), Duration::from_secs(30)), 1);
        assert_eq!(table.len(), 1);
    }
}
