//! Gossip mesh router.
//!
//! The router decides, for every message and every peer, whether to deliver,
//! forward, gossip-advertise or withhold, and keeps a small random regular
//! graph per topic healthy against churn and adversarial participants.
//!
//! ## Peer sets
//!
//! | Set | Purpose |
//! |-----|---------|
//! | Mesh | Per-topic overlay through which payloads are pushed |
//! | Fanout | Stable recipients for topics we publish to without joining |
//! | Direct | Out-of-band peering agreements; always delivered, never meshed |
//!
//! ## Control plane
//!
//! GRAFT/PRUNE negotiate mesh membership; IHAVE/IWANT implement lazy pull
//! repair from the message cache. Flood protection caps how much IHAVE a peer
//! may advertise per heartbeat, how often a message is retransmitted to the
//! same peer, and how quickly a pruned peer may graft back.
//!
//! ## Concurrency
//!
//! The router is an actor: a public cheap-to-clone [`Router`] handle sends
//! commands over a channel to a private [`RouterActor`] that owns all state
//! and processes commands and heartbeats on a single task. There is no lock
//! discipline over router state because there is no concurrent access to it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, GossipConfig};
use crate::host::{HostNetwork, NeverSeen, NoopTracer, ScoreProvider, SeenCache, Tracer, ZeroScore};
use crate::identity::PeerId;
use crate::mcache::MessageCache;
use crate::px::{ConnectRequest, PxDispatcher};
use crate::wire::{
    self, ControlBlock, ControlGraft, ControlIHave, ControlIWant, ControlPrune, Frame, MessageId,
    PayloadMessage, ProtocolVersion, PruneInfo,
};

/// Connection manager tag for direct peers.
const DIRECT_PEER_TAG: &str = "pubsub:direct";
const DIRECT_PEER_TAG_WEIGHT: usize = 1000;

/// Weight of the per-topic mesh membership tag.
const TOPIC_TAG_WEIGHT: usize = 20;

/// Maximum entries in the backoff table.
/// SECURITY: Bounds memory usage under adversarial graft/prune churn.
const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// Backoff sweep cadence in heartbeat ticks.
const BACKOFF_SWEEP_TICKS: u64 = 15;

fn topic_tag(topic: &str) -> String {
    format!("pubsub:{topic}")
}

/// Reasons a local publish is rejected before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    InvalidTopic,
    MessageTooLarge,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::InvalidTopic => write!(f, "invalid topic name"),
            PublishError::MessageTooLarge => write!(f, "message exceeds maximum frame size"),
        }
    }
}

impl std::error::Error for PublishError {}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Join(String, oneshot::Sender<()>),
    Leave(String, oneshot::Sender<()>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId, PublishError>>),
    Forward(PeerId, PayloadMessage, oneshot::Sender<()>),
    HandleFrame(
        PeerId,
        Frame,
        oneshot::Sender<anyhow::Result<Vec<PayloadMessage>>>,
    ),
    AddPeer {
        peer: PeerId,
        version: ProtocolVersion,
        reply: oneshot::Sender<mpsc::Receiver<Frame>>,
    },
    RemovePeer(PeerId),
    AcceptFrom(PeerId, oneshot::Sender<bool>),
    EnoughPeers {
        topic: String,
        suggested: usize,
        reply: oneshot::Sender<bool>,
    },
    MeshPeers(String, oneshot::Sender<Vec<PeerId>>),
    FanoutPeers(String, oneshot::Sender<Vec<PeerId>>),
    JoinedTopics(oneshot::Sender<Vec<String>>),
    Quit,
}

// ============================================================================
// Router Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running router actor.
#[derive(Clone)]
pub struct Router {
    cmd_tx: mpsc::Sender<Command>,
}

impl Router {
    /// Join a topic: build a mesh for it and start forwarding payloads.
    pub async fn join(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Join(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))
    }

    /// Leave a topic: dissolve its mesh, pruning every member.
    pub async fn leave(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Leave(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))
    }

    /// Publish a locally-originated message.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        Ok(rx
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))??)
    }

    /// Route an externally validated payload onward through the overlay.
    pub async fn forward(&self, received_from: PeerId, msg: PayloadMessage) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Forward(received_from, msg, tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))
    }

    /// Process an inbound frame: apply subscription options, run the control
    /// handlers, and return the payload messages for external validation.
    ///
    /// The host must filter graylisted senders first (see [`Router::accept_from`]).
    pub async fn handle_frame(
        &self,
        from: PeerId,
        frame: Frame,
    ) -> anyhow::Result<Vec<PayloadMessage>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleFrame(from, frame, tx))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))?
    }

    /// Register a connected peer. Returns the receiving end of the peer's
    /// bounded outbound queue, to be drained by the host's writer task; the
    /// writer terminates when the queue is closed.
    pub async fn add_peer(
        &self,
        peer: PeerId,
        version: ProtocolVersion,
    ) -> anyhow::Result<mpsc::Receiver<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPeer {
                peer,
                version,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))
    }

    /// Drop a disconnected peer from all router state.
    pub async fn remove_peer(&self, peer: PeerId) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::RemovePeer(peer))
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))
    }

    /// Graylist admission check for the host's inbound filter: direct peers
    /// are always accepted, others must score at least the graylist threshold.
    pub async fn accept_from(&self, peer: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::AcceptFrom(peer, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Whether a topic has enough peers to be useful; `suggested == 0` uses
    /// the configured lower mesh bound.
    pub async fn enough_peers(&self, topic: &str, suggested: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::EnoughPeers {
                topic: topic.to_string(),
                suggested,
                reply: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current mesh members for a topic.
    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::MeshPeers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current fanout members for a topic.
    pub async fn fanout_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::FanoutPeers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Topics we have joined.
    pub async fn joined_topics(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::JoinedTopics(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the router actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Router Builder
// ============================================================================

/// Strongly-typed router construction. Collaborators default to inert
/// implementations; configuration errors surface here, before any task is
/// spawned.
pub struct RouterBuilder {
    local_peer: PeerId,
    config: GossipConfig,
    direct_peers: Vec<PeerId>,
    flood_publish: bool,
    peer_exchange: bool,
    rng_seed: Option<u64>,
    score: Arc<dyn ScoreProvider>,
    seen: Arc<dyn SeenCache>,
    tracer: Arc<dyn Tracer>,
}

impl RouterBuilder {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            config: GossipConfig::default(),
            direct_peers: Vec::new(),
            flood_publish: false,
            peer_exchange: false,
            rng_seed: None,
            score: Arc::new(ZeroScore),
            seen: Arc::new(NeverSeen),
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn config(mut self, config: GossipConfig) -> Self {
        self.config = config;
        self
    }

    /// Peers with out-of-band peering agreements: unconditionally delivered
    /// to, eagerly connected, never meshed.
    pub fn direct_peers<I: IntoIterator<Item = PeerId>>(mut self, peers: I) -> Self {
        self.direct_peers = peers.into_iter().collect();
        self
    }

    /// Forward locally-originated messages to every subscribed peer above the
    /// publish threshold instead of just the mesh.
    pub fn flood_publish(mut self, enabled: bool) -> Self {
        self.flood_publish = enabled;
        self
    }

    /// Attach peer exchange candidates to PRUNE messages. Intended for
    /// bootstrappers and other well-connected nodes.
    pub fn peer_exchange(mut self, enabled: bool) -> Self {
        self.peer_exchange = enabled;
        self
    }

    /// Seed the selection PRNG; defaults to entropy.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn score(mut self, score: Arc<dyn ScoreProvider>) -> Self {
        self.score = score;
        self
    }

    pub fn seen_cache(mut self, seen: Arc<dyn SeenCache>) -> Self {
        self.seen = seen;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Validate the configuration and spawn the router actor.
    pub fn spawn(self, host: Arc<dyn HostNetwork>) -> Result<Router, ConfigError> {
        self.config.validate()?;

        let px = PxDispatcher::spawn(
            host.clone(),
            self.config.connectors,
            self.config.max_pending_connections,
            self.config.connection_timeout,
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let actor = RouterActor::new(self, host, px);
        tokio::spawn(actor.run(cmd_rx));

        Ok(Router { cmd_tx })
    }
}

// ============================================================================
// Router Actor (owns state)
// ============================================================================

struct RouterActor {
    local_peer: PeerId,
    config: GossipConfig,
    host: Arc<dyn HostNetwork>,
    score: Arc<dyn ScoreProvider>,
    seen: Arc<dyn SeenCache>,
    tracer: Arc<dyn Tracer>,
    px: PxDispatcher,
    do_px: bool,
    flood_publish: bool,

    /// Protocol version per connected peer.
    peers: HashMap<PeerId, ProtocolVersion>,
    direct: HashSet<PeerId>,
    /// Per-topic mesh membership.
    mesh: HashMap<String, HashSet<PeerId>>,
    /// Stable recipients for topics we publish to without joining.
    fanout: HashMap<String, HashSet<PeerId>>,
    last_published: HashMap<String, Instant>,
    /// Which peers are subscribed to which topics, from subscription options.
    topic_peers: HashMap<String, HashSet<PeerId>>,
    /// Per-peer outbound queues, provided by the host at add_peer.
    outbound: HashMap<PeerId, mpsc::Sender<Frame>>,
    /// IHAVE advertisements awaiting the next frame to a peer.
    pending_gossip: HashMap<PeerId, Vec<ControlIHave>>,
    /// GRAFT/PRUNE fragments retained after a dropped frame.
    pending_control: HashMap<PeerId, ControlBlock>,
    /// Inbound IHAVE frames per peer this heartbeat.
    peer_have: HashMap<PeerId, usize>,
    /// Message IDs requested from each peer this heartbeat.
    i_asked: HashMap<PeerId, usize>,
    /// (topic, peer) -> earliest instant a local GRAFT may be issued.
    backoff: LruCache<(String, PeerId), Instant>,
    heartbeat_ticks: u64,
    seqno: u64,
    mcache: MessageCache,
    rng: StdRng,
}

impl RouterActor {
    fn new(builder: RouterBuilder, host: Arc<dyn HostNetwork>, px: PxDispatcher) -> Self {
        let backoff_cap =
            NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("MAX_BACKOFF_ENTRIES must be non-zero");
        let rng = match builder.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mcache = MessageCache::new(builder.config.gossip_window, builder.config.history_length);

        Self {
            local_peer: builder.local_peer,
            host,
            score: builder.score,
            seen: builder.seen,
            tracer: builder.tracer,
            px,
            do_px: builder.peer_exchange,
            flood_publish: builder.flood_publish,
            peers: HashMap::new(),
            direct: builder.direct_peers.into_iter().collect(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            last_published: HashMap::new(),
            topic_peers: HashMap::new(),
            outbound: HashMap::new(),
            pending_gossip: HashMap::new(),
            pending_control: HashMap::new(),
            peer_have: HashMap::new(),
            i_asked: HashMap::new(),
            backoff: LruCache::new(backoff_cap),
            heartbeat_ticks: 0,
            seqno: 0,
            mcache,
            config: builder.config,
            rng,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        // direct peers are connected eagerly at startup
        for peer in self.direct.iter().copied().collect::<Vec<_>>() {
            self.px.try_enqueue(ConnectRequest {
                peer,
                signed_record: None,
            });
        }

        let start = tokio::time::Instant::now() + self.config.heartbeat_initial_delay;
        let mut heartbeat = tokio::time::interval_at(start, self.config.heartbeat_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                debug!("router actor quitting");
                                break;
                            }
                        }
                        None => {
                            debug!("router handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Join(topic, reply) => {
                self.join(&topic);
                let _ = reply.send(());
            }
            Command::Leave(topic, reply) => {
                self.leave(&topic).await;
                let _ = reply.send(());
            }
            Command::Publish(topic, data, reply) => {
                let _ = reply.send(self.publish(&topic, data));
            }
            Command::Forward(received_from, msg, reply) => {
                self.route(&received_from, msg);
                let _ = reply.send(());
            }
            Command::HandleFrame(from, frame, reply) => {
                let _ = reply.send(self.handle_frame(&from, frame).await);
            }
            Command::AddPeer {
                peer,
                version,
                reply,
            } => {
                let _ = reply.send(self.add_peer(peer, version));
            }
            Command::RemovePeer(peer) => self.remove_peer(&peer),
            Command::AcceptFrom(peer, reply) => {
                let accept = self.direct.contains(&peer)
                    || self.score.score(&peer) >= self.config.graylist_threshold;
                let _ = reply.send(accept);
            }
            Command::EnoughPeers {
                topic,
                suggested,
                reply,
            } => {
                let _ = reply.send(self.enough_peers(&topic, suggested));
            }
            Command::MeshPeers(topic, reply) => {
                let peers = self
                    .mesh
                    .get(&topic)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::FanoutPeers(topic, reply) => {
                let peers = self
                    .fanout
                    .get(&topic)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::JoinedTopics(reply) => {
                let _ = reply.send(self.mesh.keys().cloned().collect());
            }
            Command::Quit => return true,
        }
        false
    }

    // ========================================================================
    // Peer registry
    // ========================================================================

    fn add_peer(&mut self, peer: PeerId, version: ProtocolVersion) -> mpsc::Receiver<Frame> {
        debug!(
            peer = %hex::encode(&peer.as_bytes()[..8]),
            protocol = version.as_str(),
            "peer up"
        );
        self.tracer.add_peer(&peer, version);
        self.peers.insert(peer, version);

        let (tx, rx) = mpsc::channel(self.config.peer_outbound_queue_size);
        self.outbound.insert(peer, tx);

        if self.direct.contains(&peer) {
            self.host
                .tag_peer(&peer, DIRECT_PEER_TAG, DIRECT_PEER_TAG_WEIGHT);
        }
        rx
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        debug!(peer = %hex::encode(&peer.as_bytes()[..8]), "peer down");
        self.tracer.remove_peer(peer);
        self.peers.remove(peer);
        self.outbound.remove(peer);
        for members in self.mesh.values_mut() {
            members.remove(peer);
        }
        for members in self.fanout.values_mut() {
            members.remove(peer);
        }
        for subscribers in self.topic_peers.values_mut() {
            subscribers.remove(peer);
        }
        self.topic_peers.retain(|_, subscribers| !subscribers.is_empty());
        self.pending_gossip.remove(peer);
        self.pending_control.remove(peer);
    }

    fn enough_peers(&self, topic: &str, suggested: usize) -> bool {
        let Some(subscribers) = self.topic_peers.get(topic) else {
            return false;
        };

        let flood_peers = subscribers
            .iter()
            .filter(|p| self.peers.get(*p) == Some(&ProtocolVersion::Floodsub))
            .count();
        let mesh_peers = self.mesh.get(topic).map_or(0, |m| m.len());

        let suggested = if suggested == 0 {
            self.config.mesh_n_low
        } else {
            suggested
        };

        flood_peers + mesh_peers >= suggested || mesh_peers >= self.config.mesh_n_high
    }

    // ========================================================================
    // Join / Leave
    // ========================================================================

    fn join(&mut self, topic: &str) {
        if self.mesh.contains_key(topic) {
            return;
        }

        debug!(topic = %topic, "join");
        self.tracer.join(topic);

        let members: HashSet<PeerId> = if let Some(mut members) = self.fanout.remove(topic) {
            // fanout peers cleared the publish threshold, which may be
            // negative; drop the ones below zero before meshing with them
            members.retain(|p| self.score.score(p) >= 0.0);

            if members.len() < self.config.mesh_n {
                let candidates: Vec<PeerId> = self
                    .topic_candidates(topic)
                    .into_iter()
                    .filter(|p| {
                        !members.contains(p)
                            && !self.direct.contains(p)
                            && self.score.score(p) >= 0.0
                    })
                    .collect();
                let more = self.select_random(candidates, self.config.mesh_n - members.len());
                members.extend(more);
            }
            self.last_published.remove(topic);
            members
        } else {
            let candidates: Vec<PeerId> = self
                .topic_candidates(topic)
                .into_iter()
                .filter(|p| !self.direct.contains(p) && self.score.score(p) >= 0.0)
                .collect();
            self.select_random(candidates, self.config.mesh_n)
                .into_iter()
                .collect()
        };

        self.mesh.insert(topic.to_string(), members.clone());

        for peer in members {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                topic = %topic,
                "join: add mesh link"
            );
            self.tracer.graft(&peer, topic);
            self.tag_topic_peer(&peer, topic);
            let mut frame = Frame::default();
            frame.control_mut().graft.push(ControlGraft {
                topic: topic.to_string(),
            });
            self.send_frame(&peer, frame);
        }
    }

    async fn leave(&mut self, topic: &str) {
        let Some(members) = self.mesh.remove(topic) else {
            return;
        };

        debug!(topic = %topic, "leave");
        self.tracer.leave(topic);

        for peer in members {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                topic = %topic,
                "leave: remove mesh link"
            );
            self.tracer.prune(&peer, topic);
            self.untag_topic_peer(&peer, topic);
            let prune = self.make_prune(&peer, topic, true).await;
            let mut frame = Frame::default();
            frame.control_mut().prune.push(prune);
            self.send_frame(&peer, frame);
        }
    }

    // ========================================================================
    // Publish path
    // ========================================================================

    fn publish(&mut self, topic: &str, data: Vec<u8>) -> Result<MessageId, PublishError> {
        if !wire::is_valid_topic(topic) {
            return Err(PublishError::InvalidTopic);
        }
        if data.len() > wire::MAX_FRAME_SIZE {
            return Err(PublishError::MessageTooLarge);
        }

        self.seqno = self.seqno.wrapping_add(1);
        let msg = PayloadMessage {
            from: self.local_peer,
            seqno: self.seqno,
            topics: vec![topic.to_string()],
            data,
            signature: Vec::new(),
        };
        let id = msg.message_id();

        let local = self.local_peer;
        self.route(&local, msg);
        Ok(id)
    }

    /// Select recipients for a payload and send it. `received_from` is the
    /// peer that forwarded the message, or the local peer for originals.
    fn route(&mut self, received_from: &PeerId, msg: PayloadMessage) {
        self.mcache.put(msg.clone());

        let mut tosend: HashSet<PeerId> = HashSet::new();
        for topic in &msg.topics {
            let subscribers = match self.topic_peers.get(topic) {
                Some(s) => s.clone(),
                None => continue,
            };

            if self.flood_publish && *received_from == self.local_peer {
                for peer in &subscribers {
                    if self.direct.contains(peer)
                        || self.score.score(peer) >= self.config.publish_threshold
                    {
                        tosend.insert(*peer);
                    }
                }
                continue;
            }

            // direct peers
            for peer in &self.direct {
                if subscribers.contains(peer) {
                    tosend.insert(*peer);
                }
            }

            // legacy flood peers
            for peer in &subscribers {
                if self.peers.get(peer) == Some(&ProtocolVersion::Floodsub)
                    && self.score.score(peer) >= self.config.publish_threshold
                {
                    tosend.insert(*peer);
                }
            }

            // gossip peers: mesh when joined, fanout otherwise
            if let Some(members) = self.mesh.get(topic) {
                tosend.extend(members.iter().copied());
            } else {
                let mut members = self.fanout.get(topic).cloned().unwrap_or_default();
                if members.is_empty() {
                    // no fanout yet, pick some above the publish threshold
                    let candidates: Vec<PeerId> = self
                        .topic_candidates(topic)
                        .into_iter()
                        .filter(|p| {
                            !self.direct.contains(p)
                                && self.score.score(p) >= self.config.publish_threshold
                        })
                        .collect();
                    let picked = self.select_random(candidates, self.config.mesh_n);
                    if !picked.is_empty() {
                        members = picked.into_iter().collect();
                        self.fanout.insert(topic.clone(), members.clone());
                    }
                }
                self.last_published.insert(topic.clone(), Instant::now());
                tosend.extend(members);
            }
        }

        let frame = Frame::messages(vec![msg.clone()]);
        for peer in tosend {
            if peer == *received_from || peer == msg.from {
                continue;
            }
            self.send_frame(&peer, frame.clone());
        }
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    async fn handle_frame(
        &mut self,
        from: &PeerId,
        mut frame: Frame,
    ) -> anyhow::Result<Vec<PayloadMessage>> {
        for sub in &frame.subscriptions {
            if !wire::is_valid_topic(&sub.topic) {
                anyhow::bail!("invalid topic name from peer");
            }
        }

        for sub in std::mem::take(&mut frame.subscriptions) {
            if sub.subscribe {
                self.topic_peers.entry(sub.topic).or_default().insert(*from);
            } else if let Some(subscribers) = self.topic_peers.get_mut(&sub.topic) {
                subscribers.remove(from);
                if subscribers.is_empty() {
                    self.topic_peers.remove(&sub.topic);
                }
            }
        }

        if let Some(ctl) = frame.control.take() {
            let iwant = self.handle_ihave(from, &ctl);
            let msgs = self.handle_iwant(from, &ctl);
            let prune = self.handle_graft(from, &ctl).await;
            self.handle_prune(from, &ctl);

            if !(iwant.is_empty() && msgs.is_empty() && prune.is_empty()) {
                let mut reply = Frame::messages(msgs);
                if !iwant.is_empty() || !prune.is_empty() {
                    let block = reply.control_mut();
                    block.iwant = iwant;
                    block.prune = prune;
                }
                self.send_frame(from, reply);
            }
        }

        Ok(frame.publish)
    }

    fn handle_ihave(&mut self, from: &PeerId, ctl: &ControlBlock) -> Vec<ControlIWant> {
        if ctl.ihave.is_empty() {
            return Vec::new();
        }

        // ignore gossip from peers below the gossip threshold
        let score = self.score.score(from);
        if score < self.config.gossip_threshold {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                score = score,
                "ihave: ignoring peer with score below threshold"
            );
            return Vec::new();
        }

        // IHAVE flood protection
        let have = self.peer_have.entry(*from).or_insert(0);
        *have += 1;
        if *have > self.config.max_ihave_messages {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                advertisements = *have,
                "ihave: peer has advertised too many times within this heartbeat, ignoring"
            );
            return Vec::new();
        }

        let asked = self.i_asked.get(from).copied().unwrap_or(0);
        if asked >= self.config.max_ihave_length {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                asked = asked,
                "ihave: peer has already advertised too many messages, ignoring"
            );
            return Vec::new();
        }

        let mut want: HashSet<MessageId> = HashSet::new();
        for ihave in &ctl.ihave {
            if !self.mesh.contains_key(&ihave.topic) {
                continue;
            }
            for id in &ihave.message_ids {
                if self.seen.seen(id) {
                    continue;
                }
                want.insert(*id);
            }
        }

        if want.is_empty() {
            return Vec::new();
        }

        let mut ask = want.len();
        if ask + asked > self.config.max_ihave_length {
            ask = self.config.max_ihave_length - asked;
        }

        debug!(
            peer = %hex::encode(&from.as_bytes()[..8]),
            asking = ask,
            advertised = want.len(),
            "ihave: requesting messages"
        );

        let mut ids: Vec<MessageId> = want.into_iter().collect();
        // ask in random order
        ids.shuffle(&mut self.rng);
        ids.truncate(ask);
        *self.i_asked.entry(*from).or_insert(0) += ask;

        vec![ControlIWant { message_ids: ids }]
    }

    fn handle_iwant(&mut self, from: &PeerId, ctl: &ControlBlock) -> Vec<PayloadMessage> {
        if ctl.iwant.is_empty() {
            return Vec::new();
        }

        // don't serve peers below the gossip threshold
        let score = self.score.score(from);
        if score < self.config.gossip_threshold {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                score = score,
                "iwant: ignoring peer with score below threshold"
            );
            return Vec::new();
        }

        let mut out: HashMap<MessageId, PayloadMessage> = HashMap::new();
        for iwant in &ctl.iwant {
            for id in &iwant.message_ids {
                let Some((msg, prior)) = self.mcache.get_for_peer(id, from) else {
                    continue;
                };
                if prior >= self.config.gossip_retransmission {
                    debug!(
                        peer = %hex::encode(&from.as_bytes()[..8]),
                        msg_id = %hex::encode(&id[..8]),
                        "iwant: peer has asked for this message too many times, ignoring"
                    );
                    continue;
                }
                out.insert(*id, msg.clone());
            }
        }

        if !out.is_empty() {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                count = out.len(),
                "iwant: sending requested messages"
            );
        }

        out.into_values().collect()
    }

    async fn handle_graft(&mut self, from: &PeerId, ctl: &ControlBlock) -> Vec<ControlPrune> {
        if ctl.graft.is_empty() {
            return Vec::new();
        }

        let mut prune_topics: Vec<String> = Vec::new();
        let mut do_px = self.do_px;
        let score = self.score.score(from);
        let now = Instant::now();

        for graft in &ctl.graft {
            let topic = &graft.topic;

            if !self.mesh.contains_key(topic) {
                // no PRUNE for unknown topics, and no PX either: an attacker
                // probing topic names must not learn our peers
                do_px = false;
                continue;
            }

            if self.direct.contains(from) {
                // possibly a non-reciprocal peering configuration
                warn!(
                    peer = %hex::encode(&from.as_bytes()[..8]),
                    topic = %topic,
                    "graft: ignoring request from direct peer"
                );
                prune_topics.push(topic.clone());
                do_px = false;
                continue;
            }

            if let Some(expire) = self.backoff_expiry(from, topic) {
                if now < expire {
                    debug!(
                        peer = %hex::encode(&from.as_bytes()[..8]),
                        topic = %topic,
                        "graft: ignoring backed off peer"
                    );
                    // is the GRAFT coming too fast after the PRUNE?
                    let flood_cutoff = expire
                        .checked_sub(self.config.prune_backoff - self.config.graft_flood_threshold)
                        .unwrap_or(expire);
                    if now < flood_cutoff {
                        // no prune and no PX, and a penalty so that we don't
                        // graft this peer ourselves for a while
                        do_px = false;
                        self.add_backoff_penalty(from, topic);
                    } else {
                        prune_topics.push(topic.clone());
                        self.add_backoff(from, topic);
                    }
                    continue;
                }
            }

            if score < 0.0 {
                // no mesh link for negative peers, but a PRUNE is still owed
                // for protocol correctness
                debug!(
                    peer = %hex::encode(&from.as_bytes()[..8]),
                    topic = %topic,
                    score = score,
                    "graft: ignoring peer with negative score"
                );
                prune_topics.push(topic.clone());
                do_px = false;
                self.add_backoff(from, topic);
                continue;
            }

            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                topic = %topic,
                "graft: add mesh link"
            );
            self.tracer.graft(from, topic);
            if let Some(members) = self.mesh.get_mut(topic) {
                members.insert(*from);
            }
            self.tag_topic_peer(from, topic);
        }

        let mut prunes = Vec::with_capacity(prune_topics.len());
        for topic in prune_topics {
            prunes.push(self.make_prune(from, &topic, do_px).await);
        }
        prunes
    }

    fn handle_prune(&mut self, from: &PeerId, ctl: &ControlBlock) {
        if ctl.prune.is_empty() {
            return;
        }

        let score = self.score.score(from);

        for prune in &ctl.prune {
            let topic = &prune.topic;
            if !self.mesh.contains_key(topic) {
                continue;
            }

            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                topic = %topic,
                "prune: remove mesh link"
            );
            self.tracer.prune(from, topic);
            if let Some(members) = self.mesh.get_mut(topic) {
                members.remove(from);
            }
            self.untag_topic_peer(from, topic);
            self.add_backoff(from, topic);

            if !prune.peers.is_empty() {
                // ignore hand-offs from peers with insufficient score
                if score < self.config.accept_px_threshold {
                    debug!(
                        peer = %hex::encode(&from.as_bytes()[..8]),
                        topic = %topic,
                        score = score,
                        "prune: ignoring px from peer with insufficient score"
                    );
                    continue;
                }
                self.px_connect(prune.peers.clone());
            }
        }
    }

    fn px_connect(&mut self, mut candidates: Vec<PruneInfo>) {
        if candidates.len() > self.config.prune_peers {
            candidates.shuffle(&mut self.rng);
            candidates.truncate(self.config.prune_peers);
        }

        for info in candidates {
            if self.peers.contains_key(&info.peer) {
                continue;
            }
            let request = ConnectRequest {
                peer: info.peer,
                signed_record: info.signed_record,
            };
            if !self.px.try_enqueue(request) {
                debug!("px: too many pending connections, dropping remaining candidates");
                break;
            }
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    async fn heartbeat(&mut self) {
        self.heartbeat_ticks += 1;

        let mut tograft: HashMap<PeerId, Vec<String>> = HashMap::new();
        let mut toprune: HashMap<PeerId, Vec<String>> = HashMap::new();
        let mut no_px: HashSet<PeerId> = HashSet::new();

        self.clear_backoff();
        self.clear_ihave_counters();
        self.direct_connect();

        // maintain the mesh for topics we have joined
        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in topics {
            let Some(mut members) = self.mesh.remove(&topic) else {
                continue;
            };

            let mut scores: HashMap<PeerId, f64> = members
                .iter()
                .map(|p| (*p, self.score.score(p)))
                .collect();

            // drop all peers with negative score, without peer exchange
            let negative: Vec<PeerId> = members
                .iter()
                .filter(|p| scores.get(*p).copied().unwrap_or(0.0) < 0.0)
                .copied()
                .collect();
            for peer in negative {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    topic = %topic,
                    "heartbeat: prune peer with negative score"
                );
                self.prune_from_mesh(&topic, &peer, &mut members, &mut toprune);
                no_px.insert(peer);
            }

            // do we have enough peers?
            if members.len() < self.config.mesh_n_low {
                let ineed = self.config.mesh_n - members.len();
                let candidates: Vec<PeerId> = self
                    .topic_candidates(&topic)
                    .into_iter()
                    .filter(|p| {
                        !members.contains(p)
                            && self.backoff.peek(&(topic.clone(), *p)).is_none()
                            && !self.direct.contains(p)
                            && self.score.score(p) >= 0.0
                    })
                    .collect();
                for peer in self.select_random(candidates, ineed) {
                    debug!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        topic = %topic,
                        "heartbeat: add mesh link"
                    );
                    self.graft_into_mesh(&topic, &peer, &mut members, &mut tograft);
                }
            }

            // do we have too many peers?
            if members.len() > self.config.mesh_n_high {
                let mut plst: Vec<PeerId> = members.iter().copied().collect();
                // shuffle first so that score ties break randomly
                plst.shuffle(&mut self.rng);
                plst.sort_by(|a, b| {
                    let sa = scores.get(a).copied().unwrap_or(0.0);
                    let sb = scores.get(b).copied().unwrap_or(0.0);
                    sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
                });
                // keep the best D_score by score and a random remainder up to D
                let keep_by_score = self.config.mesh_n_score.min(plst.len());
                plst[keep_by_score..].shuffle(&mut self.rng);
                for peer in plst.split_off(self.config.mesh_n) {
                    debug!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        topic = %topic,
                        "heartbeat: remove mesh link"
                    );
                    self.prune_from_mesh(&topic, &peer, &mut members, &mut toprune);
                }
            }

            // should we try to improve the mesh with opportunistic grafting?
            if self.config.opportunistic_graft_ticks > 0
                && self.heartbeat_ticks % self.config.opportunistic_graft_ticks == 0
                && members.len() > 1
            {
                self.opportunistic_graft(&topic, &mut members, &mut scores, &mut tograft);
            }

            // mesh members already get pushes, gossiping to them is redundant
            self.emit_gossip(&topic, &members);

            self.mesh.insert(topic, members);
        }

        // expire fanout for topics we haven't published to in a while
        let now = Instant::now();
        let expired: Vec<String> = self
            .last_published
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.config.fanout_ttl)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in expired {
            self.fanout.remove(&topic);
            self.last_published.remove(&topic);
        }

        // maintain the fanout for topics we are publishing without joining
        let topics: Vec<String> = self.fanout.keys().cloned().collect();
        for topic in topics {
            let Some(mut members) = self.fanout.remove(&topic) else {
                continue;
            };

            // drop peers that left the topic or fell below the publish threshold
            members.retain(|p| {
                self.topic_peers
                    .get(&topic)
                    .is_some_and(|subscribers| subscribers.contains(p))
                    && self.score.score(p) >= self.config.publish_threshold
            });

            if members.len() < self.config.mesh_n {
                let ineed = self.config.mesh_n - members.len();
                let candidates: Vec<PeerId> = self
                    .topic_candidates(&topic)
                    .into_iter()
                    .filter(|p| {
                        !members.contains(p)
                            && !self.direct.contains(p)
                            && self.score.score(p) >= self.config.publish_threshold
                    })
                    .collect();
                members.extend(self.select_random(candidates, ineed));
            }

            self.emit_gossip(&topic, &members);
            self.fanout.insert(topic, members);
        }

        self.send_graft_prune(tograft, toprune, &no_px).await;

        // flush pending gossip that wasn't piggybacked above
        self.flush();

        // advance the message history window
        self.mcache.shift();
    }

    fn prune_from_mesh(
        &mut self,
        topic: &str,
        peer: &PeerId,
        members: &mut HashSet<PeerId>,
        toprune: &mut HashMap<PeerId, Vec<String>>,
    ) {
        self.tracer.prune(peer, topic);
        members.remove(peer);
        self.untag_topic_peer(peer, topic);
        self.add_backoff(peer, topic);
        toprune.entry(*peer).or_default().push(topic.to_string());
    }

    fn graft_into_mesh(
        &mut self,
        topic: &str,
        peer: &PeerId,
        members: &mut HashSet<PeerId>,
        tograft: &mut HashMap<PeerId, Vec<String>>,
    ) {
        self.tracer.graft(peer, topic);
        members.insert(*peer);
        self.tag_topic_peer(peer, topic);
        tograft.entry(*peer).or_default().push(topic.to_string());
    }

    /// Opportunistic grafting: when the median mesh score sinks below the
    /// configured threshold, pull in a few peers scoring strictly above the
    /// median. This recovers meshes stuck with poor peers after churn.
    fn opportunistic_graft(
        &mut self,
        topic: &str,
        members: &mut HashSet<PeerId>,
        scores: &mut HashMap<PeerId, f64>,
        tograft: &mut HashMap<PeerId, Vec<String>>,
    ) {
        // scores may be missing for peers grafted earlier this pass
        let missing: Vec<PeerId> = members
            .iter()
            .filter(|p| !scores.contains_key(*p))
            .copied()
            .collect();
        for peer in missing {
            scores.insert(peer, self.score.score(&peer));
        }

        let mut plst: Vec<PeerId> = members.iter().copied().collect();
        plst.sort_by(|a, b| {
            let sa = scores.get(a).copied().unwrap_or(0.0);
            let sb = scores.get(b).copied().unwrap_or(0.0);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        });
        let median = scores
            .get(&plst[plst.len() / 2])
            .copied()
            .unwrap_or(0.0);

        if median >= self.config.opportunistic_graft_threshold {
            return;
        }

        let candidates: Vec<PeerId> = self
            .topic_candidates(topic)
            .into_iter()
            .filter(|p| {
                !members.contains(p)
                    && self.backoff.peek(&(topic.to_string(), *p)).is_none()
                    && !self.direct.contains(p)
                    && self.score.score(p) > median
            })
            .collect();
        for peer in self.select_random(candidates, self.config.opportunistic_graft_peers) {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                topic = %topic,
                "heartbeat: opportunistically grafting peer"
            );
            self.graft_into_mesh(topic, &peer, members, tograft);
        }
    }

    fn clear_ihave_counters(&mut self) {
        self.peer_have.clear();
        self.i_asked.clear();
    }

    fn clear_backoff(&mut self) {
        // sweep only every few ticks to avoid iterating the table too much
        if self.heartbeat_ticks % BACKOFF_SWEEP_TICKS != 0 {
            return;
        }

        let now = Instant::now();
        let expired: Vec<(String, PeerId)> = self
            .backoff
            .iter()
            .filter(|(_, expire)| **expire <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.backoff.pop(&key);
        }
    }

    fn direct_connect(&mut self) {
        if self.config.direct_connect_ticks == 0
            || self.heartbeat_ticks % self.config.direct_connect_ticks != 0
        {
            return;
        }

        let toconnect: Vec<PeerId> = self
            .direct
            .iter()
            .filter(|p| !self.peers.contains_key(*p))
            .copied()
            .collect();
        for peer in toconnect {
            if !self.px.try_enqueue(ConnectRequest {
                peer,
                signed_record: None,
            }) {
                debug!("direct connect: px queue full, retrying next cycle");
                break;
            }
        }
    }

    /// Emit IHAVE gossip advertising cache window contents for a topic.
    /// `exclude` holds the mesh or fanout members already receiving pushes.
    fn emit_gossip(&mut self, topic: &str, exclude: &HashSet<PeerId>) {
        let mut ids = self.mcache.gossip_ids(topic);
        if ids.is_empty() {
            return;
        }
        ids.shuffle(&mut self.rng);

        let mut candidates: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|p| {
                        !exclude.contains(*p)
                            && !self.direct.contains(*p)
                            && self.peers.get(*p).is_some_and(|v| v.is_gossip())
                            && self.score.score(p) >= self.config.gossip_threshold
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let mut target = self
            .config
            .gossip_lazy
            .max((self.config.gossip_factor * candidates.len() as f64) as usize);
        if target > candidates.len() {
            target = candidates.len();
        } else {
            candidates.shuffle(&mut self.rng);
        }
        candidates.truncate(target);

        for peer in candidates {
            let peer_ids = if ids.len() > self.config.max_ihave_length {
                // a distinct random subset per recipient: the redundancy
                // raises coverage when the window outgrows one advertisement
                ids.shuffle(&mut self.rng);
                ids[..self.config.max_ihave_length].to_vec()
            } else {
                ids.clone()
            };
            self.enqueue_gossip(
                &peer,
                ControlIHave {
                    topic: topic.to_string(),
                    message_ids: peer_ids,
                },
            );
        }
    }

    async fn send_graft_prune(
        &mut self,
        tograft: HashMap<PeerId, Vec<String>>,
        mut toprune: HashMap<PeerId, Vec<String>>,
        no_px: &HashSet<PeerId>,
    ) {
        for (peer, topics) in tograft {
            let mut frame = Frame::default();
            {
                let block = frame.control_mut();
                for topic in topics {
                    block.graft.push(ControlGraft { topic });
                }
            }
            if let Some(pruning) = toprune.remove(&peer) {
                for topic in pruning {
                    let do_px = self.do_px && !no_px.contains(&peer);
                    let prune = self.make_prune(&peer, &topic, do_px).await;
                    frame.control_mut().prune.push(prune);
                }
            }
            self.send_frame(&peer, frame);
        }

        for (peer, topics) in toprune {
            let mut frame = Frame::default();
            for topic in topics {
                let do_px = self.do_px && !no_px.contains(&peer);
                let prune = self.make_prune(&peer, &topic, do_px).await;
                frame.control_mut().prune.push(prune);
            }
            self.send_frame(&peer, frame);
        }
    }

    async fn make_prune(&mut self, peer: &PeerId, topic: &str, do_px: bool) -> ControlPrune {
        let version = self
            .peers
            .get(peer)
            .copied()
            .unwrap_or(ProtocolVersion::GossipV11);
        if !version.supports_px() {
            // the peer can't parse a peer exchange payload anyway
            return ControlPrune {
                topic: topic.to_string(),
                peers: Vec::new(),
            };
        }

        let mut px = Vec::new();
        if do_px {
            let candidates: Vec<PeerId> = self
                .topic_candidates(topic)
                .into_iter()
                .filter(|p| p != peer && self.score.score(p) >= 0.0)
                .collect();
            let candidates = self.select_random(candidates, self.config.prune_peers);

            for candidate in candidates {
                // attach a signed record when the host has one; without it the
                // pruned peer falls back to its own discovery
                let signed_record = match self.host.peer_record(&candidate).await {
                    Some(record) => match wire::encode_peer_record(&record) {
                        Ok(bytes) => Some(bytes),
                        Err(err) => {
                            warn!(
                                peer = %hex::encode(&candidate.as_bytes()[..8]),
                                error = %err,
                                "error encoding signed peer record for px"
                            );
                            None
                        }
                    },
                    None => None,
                };
                px.push(PruneInfo {
                    peer: candidate,
                    signed_record,
                });
            }
        }

        ControlPrune {
            topic: topic.to_string(),
            peers: px,
        }
    }

    // ========================================================================
    // Send coalescer
    // ========================================================================

    /// Send a frame to a peer, merging any retained control fragments and
    /// pending gossip first. Writes never block: a full queue drops the frame
    /// and re-retains its GRAFT/PRUNE subsections for the next flush.
    fn send_frame(&mut self, to: &PeerId, mut frame: Frame) {
        if let Some(retained) = self.pending_control.remove(to) {
            let (grafts, prunes) = filter_stale_control(&self.mesh, to, retained);
            if !grafts.is_empty() || !prunes.is_empty() {
                let block = frame.control_mut();
                block.graft.extend(grafts);
                block.prune.extend(prunes);
            }
        }

        if let Some(ihave) = self.pending_gossip.remove(to) {
            frame.control_mut().ihave.extend(ihave);
        }

        let Some(queue) = self.outbound.get(to) else {
            return;
        };

        match queue.try_send(frame) {
            Ok(()) => self.tracer.send_rpc(to),
            Err(err) => {
                let frame = err.into_inner();
                debug!(
                    peer = %hex::encode(&to.as_bytes()[..8]),
                    "dropping frame to peer: queue full"
                );
                self.tracer.drop_rpc(to);
                if let Some(ctl) = frame.control {
                    self.push_control(to, ctl);
                }
            }
        }
    }

    /// Retain the GRAFT/PRUNE fragments of a dropped frame for the next
    /// flush. IHAVE/IWANT are fire-and-forget and never retried.
    fn push_control(&mut self, to: &PeerId, mut ctl: ControlBlock) {
        ctl.ihave.clear();
        ctl.iwant.clear();
        if !ctl.graft.is_empty() || !ctl.prune.is_empty() {
            self.pending_control.insert(*to, ctl);
        }
    }

    fn enqueue_gossip(&mut self, to: &PeerId, ihave: ControlIHave) {
        self.pending_gossip.entry(*to).or_default().push(ihave);
    }

    /// Flush pending gossip and retained control not piggybacked elsewhere.
    fn flush(&mut self) {
        // gossip first; send_frame will piggyback retained control onto it
        let peers: Vec<PeerId> = self.pending_gossip.keys().copied().collect();
        for peer in peers {
            if let Some(ihave) = self.pending_gossip.remove(&peer) {
                let mut frame = Frame::default();
                frame.control_mut().ihave = ihave;
                self.send_frame(&peer, frame);
            }
        }

        let peers: Vec<PeerId> = self.pending_control.keys().copied().collect();
        for peer in peers {
            if let Some(ctl) = self.pending_control.remove(&peer) {
                let mut frame = Frame::default();
                {
                    let block = frame.control_mut();
                    block.graft = ctl.graft;
                    block.prune = ctl.prune;
                }
                self.send_frame(&peer, frame);
            }
        }
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    fn add_backoff(&mut self, peer: &PeerId, topic: &str) {
        self.do_add_backoff(peer, topic, self.config.prune_backoff);
    }

    fn add_backoff_penalty(&mut self, peer: &PeerId, topic: &str) {
        self.do_add_backoff(peer, topic, self.config.prune_backoff_penalty);
    }

    /// Record a backoff expiry; of competing expirations only the latest is
    /// kept.
    fn do_add_backoff(&mut self, peer: &PeerId, topic: &str, interval: Duration) {
        let key = (topic.to_string(), *peer);
        let expire = Instant::now() + interval;
        let keep_existing = self
            .backoff
            .peek(&key)
            .is_some_and(|current| *current >= expire);
        if !keep_existing {
            self.backoff.put(key, expire);
            trace!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                topic = %topic,
                backoff_secs = interval.as_secs(),
                "recorded graft backoff"
            );
        }
    }

    fn backoff_expiry(&self, peer: &PeerId, topic: &str) -> Option<Instant> {
        self.backoff.peek(&(topic.to_string(), *peer)).copied()
    }

    // ========================================================================
    // Selection helpers
    // ========================================================================

    /// Gossip-capable subscribers of a topic.
    fn topic_candidates(&self, topic: &str) -> Vec<PeerId> {
        self.topic_peers
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|p| self.peers.get(*p).is_some_and(|v| v.is_gossip()))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Uniformly select up to `count` entries; `count == 0` keeps all, in
    /// random order.
    fn select_random(&mut self, mut list: Vec<PeerId>, count: usize) -> Vec<PeerId> {
        list.shuffle(&mut self.rng);
        if count > 0 && list.len() > count {
            list.truncate(count);
        }
        list
    }

    fn tag_topic_peer(&self, peer: &PeerId, topic: &str) {
        self.host.tag_peer(peer, &topic_tag(topic), TOPIC_TAG_WEIGHT);
    }

    fn untag_topic_peer(&self, peer: &PeerId, topic: &str) {
        self.host.untag_peer(peer, &topic_tag(topic));
    }
}

/// Drop retained control fragments that no longer reflect mesh state: a GRAFT
/// is only valid while the peer is in the mesh for that topic, a PRUNE only
/// while it is not.
fn filter_stale_control(
    mesh: &HashMap<String, HashSet<PeerId>>,
    peer: &PeerId,
    ctl: ControlBlock,
) -> (Vec<ControlGraft>, Vec<ControlPrune>) {
    let grafts = ctl
        .graft
        .into_iter()
        .filter(|graft| {
            mesh.get(&graft.topic)
                .is_some_and(|members| members.contains(peer))
        })
        .collect();

    let prunes = ctl
        .prune
        .into_iter()
        .filter(|prune| {
            mesh.get(&prune.topic)
                .is_none_or(|members| !members.contains(peer))
        })
        .collect();

    (grafts, prunes)
}
