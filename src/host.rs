//! Interfaces to the router's external collaborators.
//!
//! The router core owns no sockets, no validation pipeline and no scoring
//! formulas. Everything it needs from the surrounding host is expressed as a
//! trait here, so tests (and alternative hosts) can plug in their own
//! implementations.
//!
//! | Trait | Collaborator |
//! |-------|--------------|
//! | [`HostNetwork`] | Connection management and the certified address book |
//! | [`ScoreProvider`] | The peer scoring engine; scores are opaque reals |
//! | [`SeenCache`] | The host's seen-message deduplication cache |
//! | [`Tracer`] | Event tracing hooks; every method defaults to a no-op |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{PeerId, PeerRecord};
use crate::wire::{MessageId, ProtocolVersion};

/// Connection state of a peer as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// Connection management consumed by the router and the PX dispatcher.
#[async_trait]
pub trait HostNetwork: Send + Sync + 'static {
    async fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Dial a peer using whatever addresses the host knows for it.
    async fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Feed a validated signed record into the host's certified address book.
    async fn add_certified_addrs(&self, record: &PeerRecord, ttl: Duration);

    /// The host's stored signed record for a peer, if any.
    async fn peer_record(&self, peer: &PeerId) -> Option<PeerRecord>;

    /// Tag a peer in the host's connection manager so it survives pruning.
    fn tag_peer(&self, peer: &PeerId, tag: &str, weight: usize);

    fn untag_peer(&self, peer: &PeerId, tag: &str);
}

/// The peer scoring collaborator. The router only compares scores to its
/// configured thresholds; the formulas live elsewhere.
pub trait ScoreProvider: Send + Sync + 'static {
    fn score(&self, peer: &PeerId) -> f64;
}

/// Score provider used when scoring is not configured: every peer scores 0,
/// which passes every default threshold.
pub struct ZeroScore;

impl ScoreProvider for ZeroScore {
    fn score(&self, _peer: &PeerId) -> f64 {
        0.0
    }
}

/// The host's seen-message cache. The router consults it when deciding which
/// advertised IDs are worth requesting.
pub trait SeenCache: Send + Sync + 'static {
    fn seen(&self, id: &MessageId) -> bool;
}

/// Seen-cache used when none is configured: nothing is ever seen.
pub struct NeverSeen;

impl SeenCache for NeverSeen {
    fn seen(&self, _id: &MessageId) -> bool {
        false
    }
}

/// Event tracing hooks. All methods default to no-ops.
pub trait Tracer: Send + Sync + 'static {
    fn add_peer(&self, _peer: &PeerId, _version: ProtocolVersion) {}
    fn remove_peer(&self, _peer: &PeerId) {}
    fn graft(&self, _peer: &PeerId, _topic: &str) {}
    fn prune(&self, _peer: &PeerId, _topic: &str) {}
    fn join(&self, _topic: &str) {}
    fn leave(&self, _topic: &str) {}
    fn send_rpc(&self, _to: &PeerId) {}
    fn drop_rpc(&self, _to: &PeerId) {}
}

/// Tracer used when none is configured.
pub struct NoopTracer;

impl Tracer for NoopTracer {}
