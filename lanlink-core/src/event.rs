//! Typed events and the bounded dispatcher that hands them to observers.
//!
//! Engines produce events from whatever thread is driving them; delivery
//! happens on a thread the embedder controls, either by running a loop
//! around [`Dispatcher::deliver_next`] or by calling [`Dispatcher::poll`]
//! directly. Observer callbacks are never invoked from a producer thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::frame::MacAddr;

/// Event kinds observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerUp,
    PeerDown,
    MessageReceived,
    FileOffer,
    FileProgress,
    FileReceived,
    FileSendDone,
    FileSendFailed,
    TransportError,
}

/// Accept/reject token carried by a file-offer event. First decision wins;
/// an undecided token auto-accepts when the accept timeout elapses.
#[derive(Clone)]
pub struct OfferDecision(Arc<AtomicU8>);

const DECISION_PENDING: u8 = 0;
const DECISION_ACCEPT: u8 = 1;
const DECISION_REJECT: u8 = 2;

impl OfferDecision {
    pub fn new() -> OfferDecision {
        OfferDecision(Arc::new(AtomicU8::new(DECISION_PENDING)))
    }

    pub fn accept(&self) {
        let _ = self.0.compare_exchange(
            DECISION_PENDING,
            DECISION_ACCEPT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn reject(&self) {
        let _ = self.0.compare_exchange(
            DECISION_PENDING,
            DECISION_REJECT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// `None` while undecided, then `Some(accepted)`.
    pub fn get(&self) -> Option<bool> {
        match self.0.load(Ordering::SeqCst) {
            DECISION_ACCEPT => Some(true),
            DECISION_REJECT => Some(false),
            _ => None,
        }
    }
}

impl Default for OfferDecision {
    fn default() -> Self {
        OfferDecision::new()
    }
}

impl fmt::Debug for OfferDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            None => write!(f, "OfferDecision(pending)"),
            Some(true) => write!(f, "OfferDecision(accept)"),
            Some(false) => write!(f, "OfferDecision(reject)"),
        }
    }
}

/// Everything the engines report to the upper layer.
#[derive(Debug)]
pub enum Event {
    PeerUp {
        mac: MacAddr,
        display_name: Option<String>,
    },
    PeerDown {
        mac: MacAddr,
    },
    MessageReceived {
        source: MacAddr,
        text: String,
        at: SystemTime,
    },
    FileOffer {
        source: MacAddr,
        msg_id: u32,
        filename: String,
        file_size: u64,
        decision: OfferDecision,
    },
    FileProgress {
        msg_id: u32,
        dest: MacAddr,
        bytes_acked: u64,
        bytes_total: u64,
    },
    /// Terminal receiver event. On success `data` holds the reassembled
    /// file; on failure (digest mismatch, stall, peer down) `digest_ok` is
    /// false and `data` may be empty.
    FileReceived {
        source: MacAddr,
        filename: String,
        data: Vec<u8>,
        digest_ok: bool,
    },
    FileSendDone {
        msg_id: u32,
        dest: MacAddr,
        filename: String,
    },
    FileSendFailed {
        msg_id: u32,
        dest: MacAddr,
        filename: String,
        reason: String,
    },
    TransportError {
        detail: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PeerUp { .. } => EventKind::PeerUp,
            Event::PeerDown { .. } => EventKind::PeerDown,
            Event::MessageReceived { .. } => EventKind::MessageReceived,
            Event::FileOffer { .. } => EventKind::FileOffer,
            Event::FileProgress { .. } => EventKind::FileProgress,
            Event::FileReceived { .. } => EventKind::FileReceived,
            Event::FileSendDone { .. } => EventKind::FileSendDone,
            Event::FileSendFailed { .. } => EventKind::FileSendFailed,
            Event::TransportError { .. } => EventKind::TransportError,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct State {
    queue: VecDeque<Event>,
    observers: HashMap<EventKind, Vec<(String, Callback)>>,
}

/// Bounded event queue plus the observer registry. When the queue is full
/// the oldest event is dropped and counted.
pub struct Dispatcher {
    state: Mutex<State>,
    not_empty: Condvar,
    capacity: usize,
    overflow: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Dispatcher {
        Dispatcher {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(64)),
                observers: HashMap::new(),
            }),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
            overflow: AtomicU64::new(0),
        }
    }

    /// Register `callback` for `kind` under `name`. A later registration
    /// with the same kind and name replaces the earlier one.
    pub fn register<F>(&self, kind: EventKind, name: &str, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        let entries = state.observers.entry(kind).or_default();
        entries.retain(|(n, _)| n != name);
        entries.push((name.to_string(), Arc::new(callback)));
    }

    pub fn unregister(&self, kind: EventKind, name: &str) {
        let mut state = lock(&self.state);
        if let Some(entries) = state.observers.get_mut(&kind) {
            entries.retain(|(n, _)| n != name);
        }
    }

    /// Enqueue an event, dropping the oldest one if the queue is full.
    pub fn publish(&self, event: Event) {
        let mut state = lock(&self.state);
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        state.queue.push_back(event);
        self.not_empty.notify_one();
    }

    /// Pop the next event, waiting up to `timeout` for one to arrive.
    pub fn poll(&self, timeout: Duration) -> Option<Event> {
        let mut state = lock(&self.state);
        if state.queue.is_empty() {
            let (guard, _) = self
                .not_empty
                .wait_timeout(state, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
        state.queue.pop_front()
    }

    /// Invoke every observer registered for this event's kind.
    pub fn dispatch(&self, event: &Event) {
        let callbacks: Vec<Callback> = {
            let state = lock(&self.state);
            state
                .observers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Drain one event and dispatch it. Returns false on timeout. The
    /// delivery thread runs this in a loop.
    pub fn deliver_next(&self, timeout: Duration) -> bool {
        match self.poll(timeout) {
            Some(event) => {
                self.dispatch(&event);
                true
            }
            None => false,
        }
    }

    /// Events discarded because the queue was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.state).queue.len()
    }
}
