//! File transfer: offer/accept handshake, windowed FILE-DATA with
//! per-fragment retransmission, digest verification on completion.
//!
//! Terminal states (DONE / FAILED on either side) drop the transfer record
//! after emitting the terminal event; a completed inbound record lingers
//! briefly so retransmitted final fragments still get re-acked.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::event::{Event, OfferDecision};
use crate::frame::MacAddr;
use crate::integrity;
use crate::pdu::{
    self, FileAckBody, FileCompleteBody, FileOfferBody, MsgIdGen, Pdu, PduType, FLAG_ACK_REQUIRED,
    FLAG_IS_ACK, FLAG_MORE_FRAGMENTS,
};
use crate::{Action, Counters};

/// frag_index carried by a FILE-ACK that accepts an offer rather than
/// acknowledging a fragment.
pub const OFFER_ACCEPT: u16 = 0xFFFF;

/// Error building an outbound transfer.
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("file needs more than {} fragments", u16::MAX)]
    TooLarge,
}

/// Sender side. OFFERING until the acceptance sentinel, SENDING while
/// fragments are outstanding, AWAITING_COMPLETE once everything is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Offering,
    Sending,
    AwaitingComplete,
}

/// Receiver side. PENDING until the accept decision, RECEIVING while
/// fragments arrive, DONE after verification (kept briefly for re-acks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Pending,
    Receiving,
    Done,
}

struct FragTimer {
    deadline: Instant,
    retries: u32,
}

struct Outbound {
    dest: MacAddr,
    filename: String,
    file_size: u64,
    digest: [u8; 32],
    fragments: Vec<Vec<u8>>,
    acked_count: usize,
    bytes_acked: u64,
    next_unsent: usize,
    in_flight: HashMap<u16, FragTimer>,
    state: SendState,
    offer_retries: u32,
    /// Offer retransmit deadline in OFFERING, completion deadline in
    /// AWAITING_COMPLETE. Unused while SENDING.
    deadline: Instant,
}

impl Outbound {
    fn frag_total(&self) -> u16 {
        self.fragments.len() as u16
    }
}

struct Inbound {
    filename: String,
    file_size: u64,
    digest: [u8; 32],
    total: u16,
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    state: RecvState,
    decision: OfferDecision,
    accept_deadline: Instant,
    last_progress: Instant,
}

/// File-transfer engine: all outbound and inbound transfers of this node.
pub struct FileEngine {
    cfg: EngineConfig,
    ids: Arc<MsgIdGen>,
    counters: Arc<Counters>,
    outbound: HashMap<u32, Outbound>,
    inbound: HashMap<(MacAddr, u32), Inbound>,
}

impl FileEngine {
    pub fn new(cfg: EngineConfig, ids: Arc<MsgIdGen>, counters: Arc<Counters>) -> FileEngine {
        FileEngine {
            cfg,
            ids,
            counters,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    /// Start sending `data` to `dest`: allocates the transfer and returns
    /// the FILE-OFFER send. Empty files still travel as one empty fragment.
    pub fn offer_file(
        &mut self,
        dest: MacAddr,
        filename: String,
        data: &[u8],
        now: Instant,
    ) -> Result<(u32, Vec<Action>), OfferError> {
        let fragments: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(pdu::MAX_PAYLOAD).map(<[u8]>::to_vec).collect()
        };
        if fragments.len() > u16::MAX as usize {
            return Err(OfferError::TooLarge);
        }
        let msg_id = self.ids.next();
        let transfer = Outbound {
            dest,
            filename,
            file_size: data.len() as u64,
            digest: integrity::digest(data),
            fragments,
            acked_count: 0,
            bytes_acked: 0,
            next_unsent: 0,
            in_flight: HashMap::new(),
            state: SendState::Offering,
            offer_retries: 0,
            deadline: now + Duration::from_secs(self.cfg.file_offer_retry_interval),
        };
        let offer = offer_pdu(msg_id, &transfer);
        self.outbound.insert(msg_id, transfer);
        Ok((msg_id, vec![Action::Send { dest, pdu: offer }]))
    }

    /// Inbound FILE-OFFER. A fresh offer raises a file-offer event carrying
    /// the accept/reject token; a retransmitted offer for a transfer we
    /// already accepted just re-sends the acceptance, so a lost acceptance
    /// is recovered by the sender's offer retry.
    pub fn on_file_offer(
        &mut self,
        src: MacAddr,
        msg_id: u32,
        body: FileOfferBody,
        now: Instant,
    ) -> Vec<Action> {
        let key = (src, msg_id);
        if let Some(transfer) = self.inbound.get(&key) {
            return match transfer.state {
                RecvState::Receiving | RecvState::Done => vec![Action::Send {
                    dest: src,
                    pdu: ack_pdu(msg_id, OFFER_ACCEPT),
                }],
                RecvState::Pending => Vec::new(),
            };
        }
        if body.frag_count == 0 || body.frag_count > u16::MAX as u32 {
            self.counters.protocol_drops.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
        let total = body.frag_count as u16;
        let decision = OfferDecision::new();
        self.inbound.insert(
            key,
            Inbound {
                filename: body.filename.clone(),
                file_size: body.file_size,
                digest: body.digest,
                total,
                fragments: vec![None; total as usize],
                received: 0,
                state: RecvState::Pending,
                decision: decision.clone(),
                accept_deadline: now + Duration::from_secs(self.cfg.file_accept_timeout),
                last_progress: now,
            },
        );
        vec![Action::Emit(Event::FileOffer {
            source: src,
            msg_id,
            filename: body.filename,
            file_size: body.file_size,
            decision,
        })]
    }

    /// Inbound FILE-DATA. Every data frame for an accepted transfer is
    /// acknowledged, duplicates included, so the sender can recover from
    /// lost acks. The last stored fragment triggers verification.
    pub fn on_file_data(&mut self, src: MacAddr, pdu: Pdu, now: Instant) -> Vec<Action> {
        let key = (src, pdu.msg_id);
        let transfer = match self.inbound.get_mut(&key) {
            Some(transfer) => transfer,
            None => return Vec::new(),
        };
        match transfer.state {
            RecvState::Pending => Vec::new(),
            RecvState::Done => vec![Action::Send {
                dest: src,
                pdu: ack_pdu(pdu.msg_id, pdu.frag_index),
            }],
            RecvState::Receiving => {
                if pdu.frag_total != transfer.total {
                    self.counters.protocol_drops.fetch_add(1, Ordering::Relaxed);
                    self.inbound.remove(&key);
                    return Vec::new();
                }
                if pdu.frag_index >= transfer.total {
                    self.counters.protocol_drops.fetch_add(1, Ordering::Relaxed);
                    return Vec::new();
                }
                transfer.last_progress = now;
                let idx = pdu.frag_index as usize;
                if transfer.fragments[idx].is_none() {
                    transfer.fragments[idx] = Some(pdu.payload);
                    transfer.received += 1;
                }
                let mut actions = vec![Action::Send {
                    dest: src,
                    pdu: ack_pdu(pdu.msg_id, pdu.frag_index),
                }];
                if transfer.received == transfer.total {
                    let mut data = Vec::with_capacity(transfer.file_size as usize);
                    for fragment in transfer.fragments.drain(..).flatten() {
                        data.extend_from_slice(&fragment);
                    }
                    let digest_ok = integrity::verify(&data, &transfer.digest);
                    transfer.state = RecvState::Done;
                    actions.push(Action::Send {
                        dest: src,
                        pdu: complete_pdu(pdu.msg_id, digest_ok),
                    });
                    actions.push(Action::Emit(Event::FileReceived {
                        source: src,
                        filename: transfer.filename.clone(),
                        data,
                        digest_ok,
                    }));
                }
                actions
            }
        }
    }

    /// Inbound FILE-ACK: acceptance sentinel opens the send window, a
    /// fragment ack advances it.
    pub fn on_file_ack(&mut self, src: MacAddr, body: FileAckBody, now: Instant) -> Vec<Action> {
        let window = self.cfg.file_window;
        let frag_retry = Duration::from_secs(self.cfg.file_frag_retry_interval);
        let complete_timeout = Duration::from_secs(self.cfg.file_complete_timeout);
        let transfer = match self.outbound.get_mut(&body.msg_id) {
            Some(transfer) if transfer.dest == src => transfer,
            _ => return Vec::new(),
        };
        if body.frag_index == OFFER_ACCEPT {
            if transfer.state == SendState::Offering {
                transfer.state = SendState::Sending;
                return fill_window(body.msg_id, transfer, window, frag_retry, now);
            }
            return Vec::new();
        }
        if transfer.state != SendState::Sending {
            return Vec::new();
        }
        if transfer.in_flight.remove(&body.frag_index).is_none() {
            return Vec::new(); // duplicate or stray ack
        }
        let idx = body.frag_index as usize;
        transfer.acked_count += 1;
        transfer.bytes_acked += transfer.fragments[idx].len() as u64;
        let mut actions = vec![Action::Emit(Event::FileProgress {
            msg_id: body.msg_id,
            dest: transfer.dest,
            bytes_acked: transfer.bytes_acked,
            bytes_total: transfer.file_size,
        })];
        if transfer.acked_count == transfer.fragments.len() {
            transfer.state = SendState::AwaitingComplete;
            transfer.deadline = now + complete_timeout;
        } else {
            actions.extend(fill_window(body.msg_id, transfer, window, frag_retry, now));
        }
        actions
    }

    /// Inbound FILE-COMPLETE: the receiver's verdict, terminal either way.
    pub fn on_file_complete(
        &mut self,
        src: MacAddr,
        body: FileCompleteBody,
        _now: Instant,
    ) -> Vec<Action> {
        let matches = self
            .outbound
            .get(&body.msg_id)
            .map(|transfer| transfer.dest == src)
            .unwrap_or(false);
        if !matches {
            return Vec::new();
        }
        let transfer = match self.outbound.remove(&body.msg_id) {
            Some(transfer) => transfer,
            None => return Vec::new(),
        };
        if body.digest_ok {
            vec![Action::Emit(Event::FileSendDone {
                msg_id: body.msg_id,
                dest: transfer.dest,
                filename: transfer.filename,
            })]
        } else {
            let reason = if transfer.state == SendState::Offering {
                "offer rejected"
            } else {
                "digest mismatch at receiver"
            };
            vec![Action::Emit(Event::FileSendFailed {
                msg_id: body.msg_id,
                dest: transfer.dest,
                filename: transfer.filename,
                reason: reason.to_string(),
            })]
        }
    }

    /// Timer pass: offer retransmits, fragment retransmits, completion and
    /// stall timeouts, pending accept decisions.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let frag_retry = Duration::from_secs(self.cfg.file_frag_retry_interval);
        let offer_retry = Duration::from_secs(self.cfg.file_offer_retry_interval);
        let max_frag_retries = self.cfg.file_frag_max_retries;
        let max_offer_retries = self.cfg.file_offer_max_retries;
        let stall = Duration::from_secs(self.cfg.file_recv_stall_timeout);

        let mut actions = Vec::new();
        let mut failed: Vec<(u32, String)> = Vec::new();

        for (&msg_id, transfer) in self.outbound.iter_mut() {
            match transfer.state {
                SendState::Offering => {
                    if now >= transfer.deadline {
                        if transfer.offer_retries < max_offer_retries {
                            transfer.offer_retries += 1;
                            transfer.deadline = now + offer_retry;
                            actions.push(Action::Send {
                                dest: transfer.dest,
                                pdu: offer_pdu(msg_id, transfer),
                            });
                        } else {
                            failed.push((msg_id, "offer not acknowledged".to_string()));
                        }
                    }
                }
                SendState::Sending => {
                    let expired: Vec<u16> = transfer
                        .in_flight
                        .iter()
                        .filter(|(_, timer)| now >= timer.deadline)
                        .map(|(&index, _)| index)
                        .collect();
                    for index in expired {
                        let timer = match transfer.in_flight.get_mut(&index) {
                            Some(timer) => timer,
                            None => continue,
                        };
                        if timer.retries < max_frag_retries {
                            timer.retries += 1;
                            timer.deadline = now + frag_retry;
                            actions.push(Action::Send {
                                dest: transfer.dest,
                                pdu: data_pdu(
                                    msg_id,
                                    index,
                                    transfer.frag_total(),
                                    transfer.fragments[index as usize].clone(),
                                ),
                            });
                        } else {
                            failed.push((msg_id, format!("fragment {index} retry limit exceeded")));
                            break;
                        }
                    }
                }
                SendState::AwaitingComplete => {
                    if now >= transfer.deadline {
                        failed.push((msg_id, "no completion from receiver".to_string()));
                    }
                }
            }
        }
        for (msg_id, reason) in failed {
            if let Some(transfer) = self.outbound.remove(&msg_id) {
                actions.push(Action::Emit(Event::FileSendFailed {
                    msg_id,
                    dest: transfer.dest,
                    filename: transfer.filename,
                    reason,
                }));
            }
        }

        let mut rejected: Vec<(MacAddr, u32)> = Vec::new();
        let mut stalled: Vec<(MacAddr, u32)> = Vec::new();
        let mut retired: Vec<(MacAddr, u32)> = Vec::new();
        for (&(src, msg_id), transfer) in self.inbound.iter_mut() {
            match transfer.state {
                RecvState::Pending => {
                    let verdict = transfer.decision.get();
                    if verdict == Some(false) {
                        actions.push(Action::Send {
                            dest: src,
                            pdu: complete_pdu(msg_id, false),
                        });
                        rejected.push((src, msg_id));
                    } else if verdict == Some(true) || now >= transfer.accept_deadline {
                        transfer.state = RecvState::Receiving;
                        transfer.last_progress = now;
                        actions.push(Action::Send {
                            dest: src,
                            pdu: ack_pdu(msg_id, OFFER_ACCEPT),
                        });
                    }
                }
                RecvState::Receiving => {
                    if now.duration_since(transfer.last_progress) >= stall {
                        stalled.push((src, msg_id));
                    }
                }
                RecvState::Done => {
                    if now.duration_since(transfer.last_progress) >= stall {
                        retired.push((src, msg_id));
                    }
                }
            }
        }
        for key in rejected.into_iter().chain(retired) {
            self.inbound.remove(&key);
        }
        for (src, msg_id) in stalled {
            if let Some(transfer) = self.inbound.remove(&(src, msg_id)) {
                actions.push(Action::Emit(Event::FileReceived {
                    source: src,
                    filename: transfer.filename,
                    data: Vec::new(),
                    digest_ok: false,
                }));
            }
        }
        actions
    }

    /// A peer died: every transfer with it, in either direction, fails.
    pub fn fail_peer(&mut self, mac: MacAddr) -> Vec<Action> {
        let mut actions = Vec::new();
        let gone: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, transfer)| transfer.dest == mac)
            .map(|(&msg_id, _)| msg_id)
            .collect();
        for msg_id in gone {
            if let Some(transfer) = self.outbound.remove(&msg_id) {
                actions.push(Action::Emit(Event::FileSendFailed {
                    msg_id,
                    dest: transfer.dest,
                    filename: transfer.filename,
                    reason: "peer down".to_string(),
                }));
            }
        }
        let gone: Vec<(MacAddr, u32)> = self
            .inbound
            .keys()
            .filter(|(src, _)| *src == mac)
            .copied()
            .collect();
        for key in gone {
            if let Some(transfer) = self.inbound.remove(&key) {
                if transfer.state == RecvState::Receiving {
                    actions.push(Action::Emit(Event::FileReceived {
                        source: mac,
                        filename: transfer.filename,
                        data: Vec::new(),
                        digest_ok: false,
                    }));
                }
            }
        }
        actions
    }

    /// Shutdown: every in-flight transfer fails with a terminal event.
    pub fn fail_all(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for (msg_id, transfer) in self.outbound.drain() {
            actions.push(Action::Emit(Event::FileSendFailed {
                msg_id,
                dest: transfer.dest,
                filename: transfer.filename,
                reason: "shutting down".to_string(),
            }));
        }
        for ((src, _), transfer) in self.inbound.drain() {
            if transfer.state == RecvState::Receiving {
                actions.push(Action::Emit(Event::FileReceived {
                    source: src,
                    filename: transfer.filename,
                    data: Vec::new(),
                    digest_ok: false,
                }));
            }
        }
        actions
    }

    pub fn active_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn active_inbound(&self) -> usize {
        self.inbound.len()
    }
}

/// Send fragments until the window is full or nothing is left unsent.
fn fill_window(
    msg_id: u32,
    transfer: &mut Outbound,
    window: usize,
    retry: Duration,
    now: Instant,
) -> Vec<Action> {
    let mut actions = Vec::new();
    while transfer.in_flight.len() < window && transfer.next_unsent < transfer.fragments.len() {
        let index = transfer.next_unsent as u16;
        transfer.next_unsent += 1;
        actions.push(Action::Send {
            dest: transfer.dest,
            pdu: data_pdu(
                msg_id,
                index,
                transfer.frag_total(),
                transfer.fragments[index as usize].clone(),
            ),
        });
        transfer.in_flight.insert(
            index,
            FragTimer {
                deadline: now + retry,
                retries: 0,
            },
        );
    }
    actions
}

fn offer_pdu(msg_id: u32, transfer: &Outbound) -> Pdu {
    let body = FileOfferBody {
        file_size: transfer.file_size,
        frag_count: transfer.fragments.len() as u32,
        filename: transfer.filename.clone(),
        digest: transfer.digest,
    };
    Pdu {
        ptype: PduType::FileOffer,
        flags: FLAG_ACK_REQUIRED,
        msg_id,
        frag_index: 0,
        frag_total: 1,
        payload: body.encode(),
    }
}

fn data_pdu(msg_id: u32, index: u16, total: u16, payload: Vec<u8>) -> Pdu {
    let mut flags = FLAG_ACK_REQUIRED;
    if index + 1 < total {
        flags |= FLAG_MORE_FRAGMENTS;
    }
    Pdu {
        ptype: PduType::FileData,
        flags,
        msg_id,
        frag_index: index,
        frag_total: total,
        payload,
    }
}

fn ack_pdu(msg_id: u32, frag_index: u16) -> Pdu {
    Pdu {
        ptype: PduType::FileAck,
        flags: FLAG_IS_ACK,
        msg_id,
        frag_index: 0,
        frag_total: 1,
        payload: FileAckBody { msg_id, frag_index }.encode(),
    }
}

fn complete_pdu(msg_id: u32, digest_ok: bool) -> Pdu {
    Pdu {
        ptype: PduType::FileComplete,
        flags: 0,
        msg_id,
        frag_index: 0,
        frag_total: 1,
        payload: FileCompleteBody { msg_id, digest_ok }.encode(),
    }
}
