//! The running node: engines behind locks, four worker threads, and the
//! public send/query API.
//!
//! Thread layout: the receive thread blocks on the raw socket and demuxes
//! PDUs into the engines; the discovery timer fires HELLOs and the liveness
//! sweep; the scheduler drives transfer retransmission and the reassembly
//! sweep; the dispatcher thread drains the event queue into observer
//! callbacks. User calls (`send_text`, `send_file`) run on the caller's
//! thread up to frame emission. No lock is held across a socket call.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lanlink_core::discovery::Discovery;
use lanlink_core::event::Dispatcher;
use lanlink_core::frame::{self, Frame, MacAddr};
use lanlink_core::messaging::{Messaging, SendTextError};
use lanlink_core::pdu::{FileAckBody, FileCompleteBody, FileOfferBody, MsgIdGen, Pdu, PduType};
use lanlink_core::transfer::{FileEngine, OfferError};
use lanlink_core::{Action, Counters, CountersSnapshot, EngineConfig, Event, PeerRecord};

use crate::transport::{RawSocket, TransportError};

const TICK: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_POLL: Duration = Duration::from_millis(200);

/// Error starting an outbound file transfer.
#[derive(Debug, thiserror::Error)]
pub enum SendFileError {
    #[error("reading file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Offer(#[from] OfferError),
}

struct Shared {
    socket: RawSocket,
    local_mac: MacAddr,
    cfg: EngineConfig,
    discovery: Mutex<Discovery>,
    messaging: Mutex<Messaging>,
    files: Mutex<FileEngine>,
    dispatcher: Dispatcher,
    counters: Arc<Counters>,
    stop: AtomicBool,
    closing: AtomicBool,
}

/// One running lanlink node. Construct with [`Node::start`]; dropping the
/// handle broadcasts GOODBYE and stops every thread.
pub struct Node {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Node {
    /// Open the interface and start the worker threads. The first HELLO
    /// broadcast goes out within one timer tick.
    pub fn start(
        interface: &str,
        display_name: Option<String>,
        cfg: EngineConfig,
    ) -> Result<Node, TransportError> {
        let socket = RawSocket::open(interface)?;
        let local_mac = socket.local_mac();
        let ids = Arc::new(MsgIdGen::new());
        let counters = Arc::new(Counters::default());
        let dispatcher = Dispatcher::new(cfg.event_queue_capacity);
        let shared = Arc::new(Shared {
            socket,
            local_mac,
            cfg: cfg.clone(),
            discovery: Mutex::new(Discovery::new(display_name, ids.clone())),
            messaging: Mutex::new(Messaging::new(ids.clone(), counters.clone())),
            files: Mutex::new(FileEngine::new(cfg, ids, counters.clone())),
            dispatcher,
            counters,
            stop: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(4);
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .map_err(TransportError::Setup)
        };
        let s = shared.clone();
        threads.push(spawn("lanlink-recv", Box::new(move || recv_loop(s)))?);
        let s = shared.clone();
        threads.push(spawn("lanlink-timer", Box::new(move || discovery_loop(s)))?);
        let s = shared.clone();
        threads.push(spawn("lanlink-sched", Box::new(move || scheduler_loop(s)))?);
        let s = shared.clone();
        threads.push(spawn("lanlink-events", Box::new(move || dispatcher_loop(s)))?);

        Ok(Node { shared, threads })
    }

    pub fn local_mac(&self) -> MacAddr {
        self.shared.local_mac
    }

    /// Live peers (never includes dead ones).
    pub fn peers(&self) -> Vec<PeerRecord> {
        lock(&self.shared.discovery).peers()
    }

    /// Observer registry and event queue.
    pub fn events(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            counters: self.shared.counters.snapshot(),
            dispatcher_overflow: self.shared.dispatcher.overflow_count(),
        }
    }

    /// Send a text message (broadcast with `MacAddr::BROADCAST`).
    /// Best-effort; returns the msg_id.
    pub fn send_text(&self, dest: MacAddr, text: &str) -> Result<u32, SendTextError> {
        let (msg_id, actions) = lock(&self.shared.messaging).send_text(dest, text)?;
        perform(&self.shared, actions);
        Ok(msg_id)
    }

    /// Offer a file to `dest`. The transfer runs in the background; its
    /// outcome arrives as a file-send-done or file-send-failed event for
    /// the returned msg_id.
    pub fn send_file(&self, dest: MacAddr, path: &Path) -> Result<u32, SendFileError> {
        let data = std::fs::read(path)?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "file.bin".to_string());
        let (msg_id, actions) =
            lock(&self.shared.files).offer_file(dest, filename, &data, Instant::now())?;
        perform(&self.shared, actions);
        Ok(msg_id)
    }

    /// Broadcast GOODBYE, fail in-flight transfers, stop and join every
    /// worker thread.
    pub fn shutdown(mut self) {
        shutdown_inner(&self.shared);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        shutdown_inner(&self.shared);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Point-in-time node statistics.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub counters: CountersSnapshot,
    pub dispatcher_overflow: u64,
}

fn shutdown_inner(shared: &Shared) {
    if shared.closing.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut actions = lock(&shared.files).fail_all();
    actions.push(lock(&shared.discovery).goodbye());
    perform(shared, actions);
    shared.stop.store(true, Ordering::SeqCst);
}

/// Carry out engine actions: encode and send frames, expand peer-down into
/// transfer failures, enqueue events.
fn perform(shared: &Shared, actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::Send { dest, pdu } => {
                let frame = Frame::new(dest, shared.local_mac, pdu.encode());
                if let Err(err) = shared.socket.send(&frame.encode()) {
                    shared.dispatcher.publish(Event::TransportError {
                        detail: err.to_string(),
                    });
                }
            }
            Action::Emit(event) => {
                if let Event::PeerDown { mac } = &event {
                    let failures = lock(&shared.files).fail_peer(*mac);
                    perform(shared, failures);
                }
                shared.dispatcher.publish(event);
            }
        }
    }
}

/// Decode, filter and demux one received frame into the engine for its
/// PDU type. Parse failures discard the frame and tick a counter.
fn handle_frame(shared: &Shared, bytes: &[u8], now: Instant) {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(_) => {
            shared
                .counters
                .malformed_frames
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    if frame.ethertype != frame::ETHERTYPE {
        return;
    }
    if frame.src == shared.local_mac {
        return; // our own broadcast, looped back
    }
    if !frame.dst.is_broadcast() && frame.dst != shared.local_mac {
        return;
    }
    let pdu = match Pdu::parse(&frame.payload) {
        Ok(pdu) => pdu,
        Err(_) => {
            shared.counters.bad_pdus.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let src = frame.src;
    let actions = match pdu.ptype {
        PduType::Hello => lock(&shared.discovery).on_hello(src, &pdu.payload, now),
        PduType::HelloAck => lock(&shared.discovery).on_hello_ack(src, &pdu.payload, now),
        PduType::Goodbye => lock(&shared.discovery).on_goodbye(src),
        PduType::Text => lock(&shared.messaging).on_text(src, pdu, now),
        PduType::FileOffer => match FileOfferBody::parse(&pdu.payload) {
            Ok(body) => lock(&shared.files).on_file_offer(src, pdu.msg_id, body, now),
            Err(_) => {
                shared.counters.bad_pdus.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
        PduType::FileData => lock(&shared.files).on_file_data(src, pdu, now),
        PduType::FileAck => match FileAckBody::parse(&pdu.payload) {
            Ok(body) => lock(&shared.files).on_file_ack(src, body, now),
            Err(_) => {
                shared.counters.bad_pdus.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
        PduType::FileComplete => match FileCompleteBody::parse(&pdu.payload) {
            Ok(body) => lock(&shared.files).on_file_complete(src, body, now),
            Err(_) => {
                shared.counters.bad_pdus.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
    };
    perform(shared, actions);
}

fn recv_loop(shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match shared.socket.recv() {
            Ok(Some((bytes, at))) => handle_frame(&shared, &bytes, at),
            Ok(None) => {}
            Err(err) => {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                shared.dispatcher.publish(Event::TransportError {
                    detail: err.to_string(),
                });
                let actions = lock(&shared.files).fail_all();
                perform(&shared, actions);
                break;
            }
        }
    }
}

fn discovery_loop(shared: Arc<Shared>) {
    let hello_interval = Duration::from_secs(shared.cfg.hello_interval);
    let stale_after = Duration::from_secs(shared.cfg.peer_stale_after);
    let dead_after = Duration::from_secs(shared.cfg.peer_dead_after);
    let mut next_hello = Instant::now();
    let mut next_sweep = Instant::now() + SWEEP_INTERVAL;
    while !shared.stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_hello {
            let hello = lock(&shared.discovery).hello();
            perform(&shared, vec![hello]);
            next_hello = now + hello_interval;
        }
        if now >= next_sweep {
            let actions = lock(&shared.discovery).sweep(now, stale_after, dead_after);
            perform(&shared, actions);
            next_sweep = now + SWEEP_INTERVAL;
        }
        thread::sleep(TICK);
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    let reassembly_timeout = Duration::from_secs(shared.cfg.reassembly_timeout);
    let mut next_reassembly_sweep = Instant::now() + REASSEMBLY_SWEEP_INTERVAL;
    while !shared.stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        let actions = lock(&shared.files).tick(now);
        perform(&shared, actions);
        if now >= next_reassembly_sweep {
            lock(&shared.messaging).sweep(now, reassembly_timeout);
            next_reassembly_sweep = now + REASSEMBLY_SWEEP_INTERVAL;
        }
        thread::sleep(TICK);
    }
}

fn dispatcher_loop(shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        shared.dispatcher.deliver_next(EVENT_POLL);
    }
    // Deliver terminal events queued during shutdown.
    while shared.dispatcher.deliver_next(Duration::ZERO) {}
}
