//! Router configuration.
//!
//! All tunables live in an immutable [`GossipConfig`] constructed up front and
//! threaded into the router; tests build alternate configurations instead of
//! mutating globals. [`GossipConfig::validate`] is called at construction and
//! surfaces parameter errors synchronously, before the router is started.

use std::fmt;
use std::time::Duration;

// ============================================================================
// Overlay parameters
// ============================================================================

/// D - Target number of peers in the mesh per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - Minimum mesh size before grafting more peers.
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// D_hi - Maximum mesh size before pruning excess peers.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_score - Number of mesh slots reserved for the best-scoring peers when
/// pruning an oversized mesh.
pub const DEFAULT_MESH_N_SCORE: usize = 4;

/// D_lazy - Minimum number of peers to emit IHAVE gossip to per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

// ============================================================================
// Gossip parameters
// ============================================================================

/// Number of history window slots retained in the message cache.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;

/// Number of most recent window slots advertised in IHAVE.
pub const DEFAULT_GOSSIP_WINDOW: usize = 3;

/// Fraction of eligible peers to gossip to, when larger than D_lazy.
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;

/// Maximum times a message is retransmitted to the same peer via IWANT.
pub const DEFAULT_GOSSIP_RETRANSMISSION: usize = 3;

/// Maximum message IDs in an IHAVE advertisement. Also caps the IDs we will
/// request from a single peer within a heartbeat.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;

/// Maximum IHAVE frames accepted from a peer within a heartbeat.
pub const DEFAULT_MAX_IHAVE_MESSAGES: usize = 10;

// ============================================================================
// Heartbeat and lifetimes
// ============================================================================

/// Delay before the first heartbeat.
pub const DEFAULT_HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Lifetime of a fanout entry without a local publish.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Backoff before a pruned peer may be grafted again.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// A GRAFT arriving this close to the PRUNE that caused the backoff is a
/// flood; must be less than the prune backoff.
pub const DEFAULT_GRAFT_FLOOD_THRESHOLD: Duration = Duration::from_secs(10);

/// Backoff penalty applied to GRAFT flooders.
pub const DEFAULT_PRUNE_BACKOFF_PENALTY: Duration = Duration::from_secs(3600);

/// Heartbeat ticks between reconnect attempts for disconnected direct peers.
pub const DEFAULT_DIRECT_CONNECT_TICKS: u64 = 300;

/// Heartbeat ticks between opportunistic grafting passes.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_TICKS: u64 = 60;

/// Number of peers to opportunistically graft per pass.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

// ============================================================================
// Peer exchange
// ============================================================================

/// Number of peer candidates included in PRUNE peer exchange.
pub const DEFAULT_PRUNE_PEERS: usize = 16;

/// Number of PX connector workers.
pub const DEFAULT_CONNECTORS: usize = 8;

/// Capacity of the PX connect queue.
pub const DEFAULT_MAX_PENDING_CONNECTIONS: usize = 128;

/// Timeout for a single outbound connection attempt.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Outbound queues
// ============================================================================

/// Capacity of each per-peer outbound frame queue.
pub const DEFAULT_PEER_OUTBOUND_QUEUE_SIZE: usize = 32;

// ============================================================================
// Score thresholds
// ============================================================================

/// Score below which we neither emit nor accept gossip with a peer.
pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -25.0;

/// Score below which we do not publish to a peer.
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -50.0;

/// Score below which a peer's frames are ignored entirely.
pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -100.0;

/// Minimum score for honoring peer exchange from a pruning peer.
pub const DEFAULT_ACCEPT_PX_THRESHOLD: f64 = 0.0;

/// Median mesh score below which opportunistic grafting kicks in.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD: f64 = 1.0;

/// Router configuration. See the module constants for the defaults.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// D - Target mesh degree per topic.
    pub mesh_n: usize,
    /// D_lo - Lower bound on mesh degree before grafting.
    pub mesh_n_low: usize,
    /// D_hi - Upper bound on mesh degree before pruning.
    pub mesh_n_high: usize,
    /// D_score - Mesh slots kept by score when pruning an oversized mesh.
    pub mesh_n_score: usize,
    /// D_lazy - Minimum gossip recipients per heartbeat.
    pub gossip_lazy: usize,

    /// Message cache history slots.
    pub history_length: usize,
    /// History slots advertised through IHAVE.
    pub gossip_window: usize,
    /// Fraction of eligible peers to gossip to.
    pub gossip_factor: f64,
    /// Per-peer retransmission limit for IWANT responses.
    pub gossip_retransmission: usize,
    /// Cap on advertised/requested message IDs per peer per heartbeat.
    pub max_ihave_length: usize,
    /// Cap on IHAVE frames accepted per peer per heartbeat.
    pub max_ihave_messages: usize,

    pub heartbeat_initial_delay: Duration,
    pub heartbeat_interval: Duration,
    pub fanout_ttl: Duration,
    pub prune_backoff: Duration,
    /// Flood window after a PRUNE; must stay below `prune_backoff`.
    pub graft_flood_threshold: Duration,
    pub prune_backoff_penalty: Duration,
    pub direct_connect_ticks: u64,
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,

    /// Peer exchange candidates attached to a PRUNE.
    pub prune_peers: usize,
    /// PX connector worker count.
    pub connectors: usize,
    /// PX connect queue capacity.
    pub max_pending_connections: usize,
    pub connection_timeout: Duration,

    /// Capacity of each per-peer outbound queue.
    pub peer_outbound_queue_size: usize,

    pub gossip_threshold: f64,
    pub publish_threshold: f64,
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,
    pub opportunistic_graft_threshold: f64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            mesh_n_score: DEFAULT_MESH_N_SCORE,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,

            history_length: DEFAULT_HISTORY_LENGTH,
            gossip_window: DEFAULT_GOSSIP_WINDOW,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,
            gossip_retransmission: DEFAULT_GOSSIP_RETRANSMISSION,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_ihave_messages: DEFAULT_MAX_IHAVE_MESSAGES,

            heartbeat_initial_delay: DEFAULT_HEARTBEAT_INITIAL_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            graft_flood_threshold: DEFAULT_GRAFT_FLOOD_THRESHOLD,
            prune_backoff_penalty: DEFAULT_PRUNE_BACKOFF_PENALTY,
            direct_connect_ticks: DEFAULT_DIRECT_CONNECT_TICKS,
            opportunistic_graft_ticks: DEFAULT_OPPORTUNISTIC_GRAFT_TICKS,
            opportunistic_graft_peers: DEFAULT_OPPORTUNISTIC_GRAFT_PEERS,

            prune_peers: DEFAULT_PRUNE_PEERS,
            connectors: DEFAULT_CONNECTORS,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,

            peer_outbound_queue_size: DEFAULT_PEER_OUTBOUND_QUEUE_SIZE,

            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            accept_px_threshold: DEFAULT_ACCEPT_PX_THRESHOLD,
            opportunistic_graft_threshold: DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD,
        }
    }
}

impl GossipConfig {
    /// Check parameter consistency. Called by the router builder before the
    /// actor is spawned; a failing configuration never starts a router.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_n_low > self.mesh_n || self.mesh_n > self.mesh_n_high {
            return Err(ConfigError::MeshDegreeBounds {
                low: self.mesh_n_low,
                target: self.mesh_n,
                high: self.mesh_n_high,
            });
        }
        if self.mesh_n_score > self.mesh_n {
            return Err(ConfigError::ScoreSlotsExceedDegree {
                score_slots: self.mesh_n_score,
                target: self.mesh_n,
            });
        }
        if self.history_length == 0 || self.gossip_window > self.history_length {
            return Err(ConfigError::HistoryWindow {
                gossip_window: self.gossip_window,
                history_length: self.history_length,
            });
        }
        if !(0.0..=1.0).contains(&self.gossip_factor) {
            return Err(ConfigError::GossipFactor(self.gossip_factor));
        }
        if self.graft_flood_threshold >= self.prune_backoff {
            return Err(ConfigError::GraftFloodThreshold {
                threshold: self.graft_flood_threshold,
                backoff: self.prune_backoff,
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.connectors == 0 {
            return Err(ConfigError::NoConnectors);
        }
        if self.peer_outbound_queue_size == 0 {
            return Err(ConfigError::ZeroOutboundQueue);
        }
        if self.gossip_threshold > 0.0 {
            return Err(ConfigError::Threshold("gossip threshold must be <= 0"));
        }
        if self.publish_threshold > self.gossip_threshold {
            return Err(ConfigError::Threshold(
                "publish threshold must be <= gossip threshold",
            ));
        }
        if self.graylist_threshold > self.publish_threshold {
            return Err(ConfigError::Threshold(
                "graylist threshold must be <= publish threshold",
            ));
        }
        if self.accept_px_threshold < 0.0 {
            return Err(ConfigError::Threshold("accept PX threshold must be >= 0"));
        }
        if self.opportunistic_graft_threshold < 0.0 {
            return Err(ConfigError::Threshold(
                "opportunistic graft threshold must be >= 0",
            ));
        }
        Ok(())
    }
}

/// Configuration errors, surfaced synchronously at router construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MeshDegreeBounds {
        low: usize,
        target: usize,
        high: usize,
    },
    ScoreSlotsExceedDegree {
        score_slots: usize,
        target: usize,
    },
    HistoryWindow {
        gossip_window: usize,
        history_length: usize,
    },
    GossipFactor(f64),
    GraftFloodThreshold {
        threshold: Duration,
        backoff: Duration,
    },
    ZeroHeartbeat,
    NoConnectors,
    ZeroOutboundQueue,
    Threshold(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MeshDegreeBounds { low, target, high } => write!(
                f,
                "mesh degree bounds must satisfy low <= target <= high (got {low} <= {target} <= {high})"
            ),
            ConfigError::ScoreSlotsExceedDegree { score_slots, target } => write!(
                f,
                "score-retained slots ({score_slots}) exceed target degree ({target})"
            ),
            ConfigError::HistoryWindow {
                gossip_window,
                history_length,
            } => write!(
                f,
                "gossip window ({gossip_window}) must not exceed history length ({history_length}, nonzero)"
            ),
            ConfigError::GossipFactor(v) => {
                write!(f, "gossip factor must be within [0, 1] (got {v})")
            }
            ConfigError::GraftFloodThreshold { threshold, backoff } => write!(
                f,
                "graft flood threshold ({threshold:?}) must be below prune backoff ({backoff:?})"
            ),
            ConfigError::ZeroHeartbeat => write!(f, "heartbeat interval must be nonzero"),
            ConfigError::NoConnectors => write!(f, "at least one PX connector is required"),
            ConfigError::ZeroOutboundQueue => {
                write!(f, "per-peer outbound queue capacity must be nonzero")
            }
            ConfigError::Threshold(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
