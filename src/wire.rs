//! Wire protocol frames.
//!
//! Every exchange between routers is a single [`Frame`]: an envelope carrying
//! subscription options, full payload messages, and an optional control block
//! with the four gossip control fragments.
//!
//! | Fragment | Direction | Purpose |
//! |----------|-----------|---------|
//! | `IHAVE`  | gossip    | Advertise recently seen message IDs for a topic |
//! | `IWANT`  | gossip    | Request messages by ID |
//! | `GRAFT`  | mesh      | Request addition to the sender's topic mesh |
//! | `PRUNE`  | mesh      | Remove from the mesh, optionally handing over peers |
//!
//! Frames are serialized with bincode under a hard size limit; peers that
//! speak only the legacy flood protocol receive payload-only frames.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerRecord};

/// Legacy flood protocol: payload frames only, no control plane.
pub const FLOODSUB_PROTOCOL: &str = "/floodsub/1.0.0";

/// Gossip mesh protocol without peer exchange.
pub const GOSSIP_PROTOCOL_V10: &str = "/meshsub/1.0.0";

/// Gossip mesh protocol with peer exchange and score-aware pruning.
pub const GOSSIP_PROTOCOL_V11: &str = "/meshsub/1.1.0";

/// Maximum encoded frame size (1 MiB).
/// SECURITY: Bounds deserialization buffers to prevent memory exhaustion.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Longest accepted topic label, in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// A topic label is non-empty, at most [`MAX_TOPIC_LEN`] bytes, and printable
/// ASCII throughout (space through tilde).
#[inline]
pub fn is_valid_topic(label: &str) -> bool {
    match label.len() {
        0 => false,
        n if n > MAX_TOPIC_LEN => false,
        _ => label.bytes().all(|b| (b' '..=b'~').contains(&b)),
    }
}

/// Protocol version spoken by a peer. Higher versions are strict supersets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    Floodsub,
    GossipV10,
    GossipV11,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::Floodsub => FLOODSUB_PROTOCOL,
            ProtocolVersion::GossipV10 => GOSSIP_PROTOCOL_V10,
            ProtocolVersion::GossipV11 => GOSSIP_PROTOCOL_V11,
        }
    }

    pub fn from_protocol_id(id: &str) -> Option<Self> {
        match id {
            FLOODSUB_PROTOCOL => Some(ProtocolVersion::Floodsub),
            GOSSIP_PROTOCOL_V10 => Some(ProtocolVersion::GossipV10),
            GOSSIP_PROTOCOL_V11 => Some(ProtocolVersion::GossipV11),
            _ => None,
        }
    }

    /// Whether the peer participates in the mesh control plane at all.
    pub fn is_gossip(&self) -> bool {
        !matches!(self, ProtocolVersion::Floodsub)
    }

    /// Whether the peer can parse peer-exchange payloads in PRUNE.
    pub fn supports_px(&self) -> bool {
        matches!(self, ProtocolVersion::GossipV11)
    }
}

/// Deterministic message identifier: blake3 over (source || seqno).
pub type MessageId = [u8; 32];

/// A full payload message as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMessage {
    /// The originating peer (canonical "from" field).
    pub from: PeerId,
    /// Source-local sequence number.
    pub seqno: u64,
    /// Topics the message is published to.
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    /// Origin signature; verified by the external validation pipeline.
    pub signature: Vec<u8>,
}

impl PayloadMessage {
    /// Deterministic identifier; colliding IDs are treated as the same message.
    pub fn message_id(&self) -> MessageId {
        let mut input = Vec::with_capacity(32 + 8);
        input.extend_from_slice(self.from.as_bytes());
        input.extend_from_slice(&self.seqno.to_le_bytes());
        *blake3::hash(&input).as_bytes()
    }
}

/// Subscription option: announce interest (or loss of interest) in a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpt {
    pub topic: String,
    pub subscribe: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

/// A peer candidate handed over in a PRUNE.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneInfo {
    pub peer: PeerId,
    /// Encoded signed [`PeerRecord`], validated by the PX dispatcher.
    pub signed_record: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    /// Peer exchange candidates; empty when PX is disabled or suppressed.
    pub peers: Vec<PruneInfo>,
}

/// The control block of a frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBlock {
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
}

impl ControlBlock {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
    }
}

/// The frame envelope exchanged between routers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub subscriptions: Vec<SubOpt>,
    pub publish: Vec<PayloadMessage>,
    pub control: Option<ControlBlock>,
}

impl Frame {
    pub fn messages(publish: Vec<PayloadMessage>) -> Self {
        Self {
            publish,
            ..Default::default()
        }
    }

    pub fn control(block: ControlBlock) -> Self {
        Self {
            control: Some(block),
            ..Default::default()
        }
    }

    /// A hello-style frame announcing the local subscription set.
    pub fn subscriptions<I: IntoIterator<Item = String>>(topics: I, subscribe: bool) -> Self {
        Self {
            subscriptions: topics
                .into_iter()
                .map(|topic| SubOpt { topic, subscribe })
                .collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.publish.is_empty()
            && self.control.as_ref().is_none_or(|c| c.is_empty())
    }

    /// The control block, created on demand.
    pub fn control_mut(&mut self) -> &mut ControlBlock {
        self.control.get_or_insert_with(ControlBlock::default)
    }
}

/// Bincode options with the frame size limit enforced.
/// SECURITY: Always use these for deserialization.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_peer_record(record: &PeerRecord) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(record)
}

pub fn decode_peer_record(bytes: &[u8]) -> Result<PeerRecord, bincode::Error> {
    bincode_options().deserialize(bytes)
}
