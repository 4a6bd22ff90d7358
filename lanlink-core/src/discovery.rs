//! Discovery: HELLO broadcasts, HELLO-ACK replies, liveness sweep, GOODBYE.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::frame::MacAddr;
use crate::pdu::{self, MsgIdGen, Pdu, PduType};
use crate::peer::{PeerRecord, PeerTable};
use crate::Action;

/// Discovery engine. Owns the peer table; everything else reads peers
/// through [`Discovery::peers`] snapshots.
pub struct Discovery {
    display_name: Option<String>,
    peers: PeerTable,
    ids: Arc<MsgIdGen>,
}

impl Discovery {
    pub fn new(display_name: Option<String>, ids: Arc<MsgIdGen>) -> Discovery {
        Discovery {
            display_name: display_name.map(|name| truncate_name(&name)),
            peers: PeerTable::new(),
            ids,
        }
    }

    fn name_payload(&self) -> Vec<u8> {
        self.display_name
            .as_deref()
            .map(|name| name.as_bytes().to_vec())
            .unwrap_or_default()
    }

    /// The periodic HELLO broadcast.
    pub fn hello(&self) -> Action {
        Action::Send {
            dest: MacAddr::BROADCAST,
            pdu: Pdu::single(PduType::Hello, self.ids.next(), self.name_payload()),
        }
    }

    /// The GOODBYE broadcast sent once at shutdown.
    pub fn goodbye(&self) -> Action {
        Action::Send {
            dest: MacAddr::BROADCAST,
            pdu: Pdu::single(PduType::Goodbye, self.ids.next(), Vec::new()),
        }
    }

    /// Inbound HELLO: track the sender; a previously unknown peer gets a
    /// peer-up event and an immediate unicast HELLO-ACK.
    pub fn on_hello(&mut self, src: MacAddr, payload: &[u8], now: Instant) -> Vec<Action> {
        let name = parse_name(payload);
        if !self.peers.observe(src, name.clone(), now) {
            return Vec::new();
        }
        vec![
            Action::Emit(Event::PeerUp {
                mac: src,
                display_name: name,
            }),
            Action::Send {
                dest: src,
                pdu: Pdu::single(PduType::HelloAck, self.ids.next(), self.name_payload()),
            },
        ]
    }

    /// Inbound HELLO-ACK: same liveness tracking as HELLO, but never
    /// answered.
    pub fn on_hello_ack(&mut self, src: MacAddr, payload: &[u8], now: Instant) -> Vec<Action> {
        let name = parse_name(payload);
        if !self.peers.observe(src, name.clone(), now) {
            return Vec::new();
        }
        vec![Action::Emit(Event::PeerUp {
            mac: src,
            display_name: name,
        })]
    }

    /// Inbound GOODBYE: the peer is gone immediately.
    pub fn on_goodbye(&mut self, src: MacAddr) -> Vec<Action> {
        match self.peers.remove(src) {
            Some(record) => vec![Action::Emit(Event::PeerDown { mac: record.mac })],
            None => Vec::new(),
        }
    }

    /// Liveness sweep: stale peers are marked, dead peers are removed with
    /// exactly one peer-down each.
    pub fn sweep(
        &mut self,
        now: Instant,
        stale_after: Duration,
        dead_after: Duration,
    ) -> Vec<Action> {
        self.peers
            .sweep(now, stale_after, dead_after)
            .into_iter()
            .map(|record| Action::Emit(Event::PeerDown { mac: record.mac }))
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.list()
    }

    pub fn contains(&self, mac: MacAddr) -> bool {
        self.peers.contains(mac)
    }
}

fn parse_name(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    std::str::from_utf8(payload)
        .ok()
        .map(truncate_name)
        .filter(|name| !name.is_empty())
}

/// Clamp a display name to the wire limit without splitting a character.
fn truncate_name(name: &str) -> String {
    if name.len() <= pdu::MAX_DISPLAY_NAME {
        return name.to_string();
    }
    let mut end = pdu::MAX_DISPLAY_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(15);
    const DEAD: Duration = Duration::from_secs(30);

    fn mac(b: u8) -> MacAddr {
        MacAddr([b; 6])
    }

    fn engine(name: Option<&str>) -> Discovery {
        Discovery::new(name.map(String::from), Arc::new(MsgIdGen::new()))
    }

    #[test]
    fn hello_is_broadcast_with_name() {
        let disc = engine(Some("nodo-a"));
        match disc.hello() {
            Action::Send { dest, pdu } => {
                assert_eq!(dest, MacAddr::BROADCAST);
                assert_eq!(pdu.ptype, PduType::Hello);
                assert_eq!(pdu.payload, b"nodo-a");
                assert_eq!(pdu.frag_total, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn new_peer_gets_peer_up_and_unicast_ack() {
        let mut disc = engine(None);
        let actions = disc.on_hello(mac(1), b"nodo-b", Instant::now());
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[0],
            Action::Emit(Event::PeerUp { mac: m, display_name: Some(name) })
                if *m == mac(1) && name == "nodo-b"
        ));
        match &actions[1] {
            Action::Send { dest, pdu } => {
                assert_eq!(*dest, mac(1));
                assert_eq!(pdu.ptype, PduType::HelloAck);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn known_peer_hello_refreshes_without_reply() {
        let mut disc = engine(None);
        let t0 = Instant::now();
        disc.on_hello(mac(1), &[], t0);
        let actions = disc.on_hello(mac(1), &[], t0 + Duration::from_secs(1));
        assert!(actions.is_empty());
        assert_eq!(disc.peers().len(), 1);
    }

    #[test]
    fn hello_ack_tracked_but_never_answered() {
        let mut disc = engine(None);
        let actions = disc.on_hello_ack(mac(2), b"nodo-c", Instant::now());
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Emit(Event::PeerUp { .. })));
        assert!(disc.contains(mac(2)));
    }

    #[test]
    fn goodbye_emits_single_peer_down() {
        let mut disc = engine(None);
        disc.on_hello(mac(1), &[], Instant::now());
        let actions = disc.on_goodbye(mac(1));
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::Emit(Event::PeerDown { mac: m }) if *m == mac(1)
        ));
        assert!(disc.on_goodbye(mac(1)).is_empty());
        assert!(disc.peers().is_empty());
    }

    #[test]
    fn silent_peer_goes_stale_then_down_once() {
        let mut disc = engine(None);
        let t0 = Instant::now();
        disc.on_hello(mac(1), &[], t0);

        assert!(disc.sweep(t0 + Duration::from_secs(15), STALE, DEAD).is_empty());
        assert_eq!(disc.peers()[0].state, crate::peer::PeerState::Stale);

        let actions = disc.sweep(t0 + Duration::from_secs(30), STALE, DEAD);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Emit(Event::PeerDown { .. })));
        assert!(disc.sweep(t0 + Duration::from_secs(45), STALE, DEAD).is_empty());
    }

    #[test]
    fn oversize_name_truncated_on_char_boundary() {
        let long = "á".repeat(40); // 80 bytes
        let truncated = truncate_name(&long);
        assert!(truncated.len() <= pdu::MAX_DISPLAY_NAME);
        assert_eq!(truncated, "á".repeat(32));
    }

    #[test]
    fn invalid_utf8_name_ignored() {
        let mut disc = engine(None);
        let actions = disc.on_hello(mac(1), &[0xFF, 0xFE], Instant::now());
        assert!(matches!(
            &actions[0],
            Action::Emit(Event::PeerUp { display_name: None, .. })
        ));
    }
}
