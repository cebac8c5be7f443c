//! Sliding-window message cache.
//!
//! Recently routed payloads are kept for a fixed number of heartbeat windows
//! so they can be served to peers pulling via IWANT. Only the most recent
//! `gossip_window` slots are advertised through IHAVE; older slots exist to
//! satisfy stragglers. The cache also counts, per peer, how often each
//! message has been handed out so the control handler can cut off
//! retransmission abuse.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::wire::{MessageId, PayloadMessage};

struct CacheEntry {
    id: MessageId,
    topics: Vec<String>,
}

/// Windowed store of recent payloads with per-peer retransmit accounting.
pub struct MessageCache {
    gossip_window: usize,
    /// `history[0]` is the current slot; `shift` pushes a fresh slot in front.
    history: Vec<Vec<CacheEntry>>,
    msgs: HashMap<MessageId, PayloadMessage>,
    /// Per-message, per-peer retrieval counts; dropped when the message ages out.
    transmissions: HashMap<MessageId, HashMap<PeerId, usize>>,
}

impl MessageCache {
    /// `gossip_window` must not exceed `history_length`; the router validates
    /// this relation in [`crate::config::GossipConfig::validate`].
    pub fn new(gossip_window: usize, history_length: usize) -> Self {
        assert!(
            gossip_window <= history_length && history_length > 0,
            "invalid message cache window parameters"
        );
        let mut history = Vec::with_capacity(history_length);
        history.resize_with(history_length, Vec::new);
        Self {
            gossip_window,
            history,
            msgs: HashMap::new(),
            transmissions: HashMap::new(),
        }
    }

    /// Record a payload in the current window slot. Idempotent: a message
    /// already in the window is not re-added.
    pub fn put(&mut self, msg: PayloadMessage) {
        let id = msg.message_id();
        if self.msgs.contains_key(&id) {
            return;
        }
        self.history[0].push(CacheEntry {
            id,
            topics: msg.topics.clone(),
        });
        self.msgs.insert(id, msg);
    }

    /// Look up a message without touching retransmission accounting.
    pub fn get(&self, id: &MessageId) -> Option<&PayloadMessage> {
        self.msgs.get(id)
    }

    /// Look up a message for delivery to `peer`, returning the number of
    /// times it was previously handed to that peer. The counter is bumped
    /// after the read, so the first retrieval reports zero.
    pub fn get_for_peer(&mut self, id: &MessageId, peer: &PeerId) -> Option<(&PayloadMessage, usize)> {
        let msg = self.msgs.get(id)?;
        let count = self
            .transmissions
            .entry(*id)
            .or_default()
            .entry(*peer)
            .or_insert(0);
        let prior = *count;
        *count += 1;
        Some((msg, prior))
    }

    /// IDs in the most recent `gossip_window` slots for `topic`, in
    /// unspecified order.
    pub fn gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        self.history[..self.gossip_window]
            .iter()
            .flatten()
            .filter(|entry| entry.topics.iter().any(|t| t == topic))
            .map(|entry| entry.id)
            .collect()
    }

    /// Advance the window: a fresh current slot appears, the oldest slot is
    /// discarded along with its payloads and retransmission counters.
    pub fn shift(&mut self) {
        if let Some(evicted) = self.history.pop() {
            for entry in evicted {
                self.msgs.remove(&entry.id);
                self.transmissions.remove(&entry.id);
            }
        }
        self.history.insert(0, Vec::new());
    }
}
