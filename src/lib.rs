//! # Meshcast - Gossip PubSub Overlay Router
//!
//! Meshcast is the routing core of a gossip-based publish/subscribe overlay:
//! it decides, for every message and every peer, whether to deliver, forward,
//! gossip-advertise or withhold, and continuously maintains a small random
//! regular graph (the "mesh") per topic against churn and adversarial
//! participants.
//!
//! ## Architecture
//!
//! The router uses the **Actor Pattern**: a cheap-to-clone [`Router`] handle
//! talks over async channels to a private actor that owns all mutable state
//! and processes commands and heartbeats sequentially. External collaborators
//! (the connection-managing host, the peer scoring engine, the seen-message
//! cache, event tracing) are consumed through the traits in [`host`]; the
//! core never holds a lock over router state because nothing else can touch
//! it.
//!
//! ## Protocol
//!
//! Peers exchange [`Frame`]s carrying subscription options, payload messages,
//! and a control block:
//!
//! 1. **Publish**: payloads are pushed to mesh (or fanout/direct/flood) peers
//! 2. **IHAVE**: non-mesh peers receive message ID advertisements
//! 3. **IWANT**: peers pull messages they missed, within retransmit limits
//! 4. **GRAFT**: a peer asks to join our mesh for a topic
//! 5. **PRUNE**: a peer is evicted, optionally handed replacement candidates
//!
//! ## Hardening
//!
//! - Per-heartbeat caps on accepted IHAVE advertisements and requested IDs
//! - Per-peer retransmission limits on IWANT responses
//! - Backoff (with penalties) against graft flooding
//! - Score thresholds gating gossip, publish, peer exchange and admission
//! - Bounded queues everywhere the event loop writes
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `router` | The mesh router actor, heartbeat and send coalescer |
//! | `identity` | Peer identifiers, keypairs, signed peer records |
//! | `wire` | Frame and control-plane wire types, bounded codec |
//! | `config` | Tunable parameters, validated at construction |
//! | `mcache` | Sliding-window message cache with retransmit accounting |
//! | `px` | Bounded peer-exchange connect queue and worker pool |
//! | `host` | Traits for the external collaborators |

pub mod config;
pub mod host;
pub mod identity;
pub mod mcache;
pub mod px;
pub mod router;
pub mod wire;

pub use config::{ConfigError, GossipConfig};
pub use host::{Connectedness, HostNetwork, ScoreProvider, SeenCache, Tracer};
pub use identity::{Keypair, PeerId, PeerRecord};
pub use router::{PublishError, Router, RouterBuilder};
pub use wire::{
    ControlBlock, ControlGraft, ControlIHave, ControlIWant, ControlPrune, Frame, MessageId,
    PayloadMessage, ProtocolVersion, PruneInfo, SubOpt,
};
