//! Link-layer chat and file transfer protocol engine.
//! Host-driven: no I/O; the host feeds PDUs and timer ticks into the
//! engines and carries out the actions they return.
//!
//! ## Host responsibilities
//!
//! - **I/O**: The host owns the raw link-layer socket, the receive loop and
//!   the timer threads. The engines here are pure state machines; they never
//!   open sockets or files.
//! - **Demux**: The host decodes each frame, filters on the EtherType,
//!   parses the PDU and routes it to the engine for its type (discovery,
//!   messaging, file transfer).
//! - **Actions**: Engine calls return [`Action`] lists; the host sends the
//!   frames and enqueues the events on the [`event::Dispatcher`], whose
//!   delivery thread (or poll loop) the host also runs.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod config;
pub mod discovery;
pub mod event;
pub mod frame;
pub mod integrity;
pub mod messaging;
pub mod pdu;
pub mod peer;
pub mod reassembly;
pub mod transfer;

pub use config::EngineConfig;
pub use event::{Dispatcher, Event, EventKind, OfferDecision};
pub use frame::{Frame, MacAddr};
pub use pdu::{MsgIdGen, Pdu, PduType, PROTOCOL_VERSION};
pub use peer::{PeerRecord, PeerState};

/// What an engine wants done: put a PDU on the wire, or report an event.
#[derive(Debug)]
pub enum Action {
    Send { dest: MacAddr, pdu: Pdu },
    Emit(Event),
}

/// Drop counters for the inbound path. Parse and protocol failures are
/// never fatal; they discard the offending input and tick one of these.
#[derive(Debug, Default)]
pub struct Counters {
    /// Frames shorter than an Ethernet header.
    pub malformed_frames: AtomicU64,
    /// PDUs with a bad version, type, length or body.
    pub bad_pdus: AtomicU64,
    /// Fragments or transfers dropped for violating protocol invariants.
    pub protocol_drops: AtomicU64,
    /// Reassembly slots evicted by timeout.
    pub reassembly_evictions: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            bad_pdus: self.bad_pdus.load(Ordering::Relaxed),
            protocol_drops: self.protocol_drops.load(Ordering::Relaxed),
            reassembly_evictions: self.reassembly_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub malformed_frames: u64,
    pub bad_pdus: u64,
    pub protocol_drops: u64,
    pub reassembly_evictions: u64,
}
