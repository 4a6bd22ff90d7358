//! Text messaging: fragmentation outbound, reassembly inbound. Best-effort;
//! TEXT fragments are never acknowledged.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::event::Event;
use crate::frame::MacAddr;
use crate::pdu::{self, MsgIdGen, Pdu, PduType, FLAG_MORE_FRAGMENTS};
use crate::reassembly::{Feed, ReassemblyTable};
use crate::{Action, Counters};

/// Error building an outbound text message.
#[derive(Debug, thiserror::Error)]
pub enum SendTextError {
    #[error("text does not fit in {} fragments", u16::MAX)]
    TooLong,
}

/// Messaging engine: splits outbound text across TEXT PDUs and rebuilds
/// inbound fragments into complete messages.
pub struct Messaging {
    reassembly: ReassemblyTable,
    ids: Arc<MsgIdGen>,
    counters: Arc<Counters>,
}

impl Messaging {
    pub fn new(ids: Arc<MsgIdGen>, counters: Arc<Counters>) -> Messaging {
        Messaging {
            reassembly: ReassemblyTable::new(),
            ids,
            counters,
        }
    }

    /// Fragment `text` for `dest` (unicast or broadcast). Empty text still
    /// produces one empty-payload PDU. Returns the msg_id and the send
    /// actions in fragment order.
    pub fn send_text(
        &self,
        dest: MacAddr,
        text: &str,
    ) -> Result<(u32, Vec<Action>), SendTextError> {
        let bytes = text.as_bytes();
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[][..]]
        } else {
            bytes.chunks(pdu::MAX_PAYLOAD).collect()
        };
        if chunks.len() > u16::MAX as usize {
            return Err(SendTextError::TooLong);
        }
        let total = chunks.len() as u16;
        let msg_id = self.ids.next();
        let actions = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let last = index as u16 + 1 == total;
                Action::Send {
                    dest,
                    pdu: Pdu {
                        ptype: PduType::Text,
                        flags: if last { 0 } else { FLAG_MORE_FRAGMENTS },
                        msg_id,
                        frag_index: index as u16,
                        frag_total: total,
                        payload: chunk.to_vec(),
                    },
                }
            })
            .collect();
        Ok((msg_id, actions))
    }

    /// Inbound TEXT fragment. Emits a message-received event once the whole
    /// message is present and decodes as UTF-8.
    pub fn on_text(&mut self, src: MacAddr, pdu: Pdu, now: Instant) -> Vec<Action> {
        match self.reassembly.accept(src, pdu, now) {
            Feed::Complete(bytes) => match String::from_utf8(bytes) {
                Ok(text) => vec![Action::Emit(Event::MessageReceived {
                    source: src,
                    text,
                    at: SystemTime::now(),
                })],
                Err(_) => {
                    self.counters.protocol_drops.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                }
            },
            Feed::Pending => Vec::new(),
            Feed::Rejected => {
                self.counters.protocol_drops.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    /// Evict reassembly slots that have waited longer than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) {
        let evicted = self.reassembly.sweep(now, timeout);
        if evicted > 0 {
            self.counters
                .reassembly_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    pub fn pending(&self) -> usize {
        self.reassembly.len()
    }
}
