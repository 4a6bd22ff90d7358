//! Engine timing, window and retry parameters. Intervals are in seconds.

use serde::Deserialize;

/// Protocol engine parameters. Every field has the protocol default, so an
/// empty config section is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Period of HELLO broadcasts.
    #[serde(default = "default_hello_interval")]
    pub hello_interval: u64,
    /// A peer unseen for this long is marked STALE.
    #[serde(default = "default_peer_stale_after")]
    pub peer_stale_after: u64,
    /// A peer unseen for this long is removed (peer-down).
    #[serde(default = "default_peer_dead_after")]
    pub peer_dead_after: u64,
    /// Incomplete inbound messages are dropped after this long.
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout: u64,
    /// Maximum outstanding (unacked) file fragments per transfer.
    #[serde(default = "default_file_window")]
    pub file_window: usize,
    /// Per-fragment retransmit period.
    #[serde(default = "default_file_frag_retry_interval")]
    pub file_frag_retry_interval: u64,
    /// Fragment retry ceiling; exceeding it fails the transfer.
    #[serde(default = "default_file_frag_max_retries")]
    pub file_frag_max_retries: u32,
    /// FILE-OFFER retransmit period.
    #[serde(default = "default_file_offer_retry_interval")]
    pub file_offer_retry_interval: u64,
    /// FILE-OFFER retry ceiling.
    #[serde(default = "default_file_offer_max_retries")]
    pub file_offer_max_retries: u32,
    /// How long the sender waits for FILE-COMPLETE once everything is acked.
    #[serde(default = "default_file_complete_timeout")]
    pub file_complete_timeout: u64,
    /// Receiver drops a transfer making no progress for this long.
    #[serde(default = "default_file_recv_stall_timeout")]
    pub file_recv_stall_timeout: u64,
    /// How long a file-offer waits for an observer decision before
    /// auto-accepting.
    #[serde(default = "default_file_accept_timeout")]
    pub file_accept_timeout: u64,
    /// Bounded event queue capacity; overflow drops the oldest event.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_hello_interval() -> u64 {
    5
}
fn default_peer_stale_after() -> u64 {
    15
}
fn default_peer_dead_after() -> u64 {
    30
}
fn default_reassembly_timeout() -> u64 {
    30
}
fn default_file_window() -> usize {
    16
}
fn default_file_frag_retry_interval() -> u64 {
    1
}
fn default_file_frag_max_retries() -> u32 {
    5
}
fn default_file_offer_retry_interval() -> u64 {
    2
}
fn default_file_offer_max_retries() -> u32 {
    3
}
fn default_file_complete_timeout() -> u64 {
    10
}
fn default_file_recv_stall_timeout() -> u64 {
    30
}
fn default_file_accept_timeout() -> u64 {
    2
}
fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hello_interval: default_hello_interval(),
            peer_stale_after: default_peer_stale_after(),
            peer_dead_after: default_peer_dead_after(),
            reassembly_timeout: default_reassembly_timeout(),
            file_window: default_file_window(),
            file_frag_retry_interval: default_file_frag_retry_interval(),
            file_frag_max_retries: default_file_frag_max_retries(),
            file_offer_retry_interval: default_file_offer_retry_interval(),
            file_offer_max_retries: default_file_offer_max_retries(),
            file_complete_timeout: default_file_complete_timeout(),
            file_recv_stall_timeout: default_file_recv_stall_timeout(),
            file_accept_timeout: default_file_accept_timeout(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}
