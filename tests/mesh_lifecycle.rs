//! Integration tests for mesh lifecycle and the publish path.
//!
//! These drive a router actor through its public handle with a mock host,
//! asserting on the frames peers actually receive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshcast::{
    Connectedness, ControlBlock, ControlGraft, ControlIWant, Frame, GossipConfig, HostNetwork,
    MessageId, PayloadMessage, PeerId, PeerRecord, ProtocolVersion, Router, RouterBuilder,
    ScoreProvider,
};

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Default)]
struct MockHost {
    connects: Mutex<Vec<PeerId>>,
}

#[async_trait]
impl HostNetwork for MockHost {
    async fn connectedness(&self, _peer: &PeerId) -> Connectedness {
        Connectedness::NotConnected
    }

    async fn connect(&self, peer: &PeerId) -> anyhow::Result<()> {
        self.connects.lock().unwrap().push(*peer);
        Ok(())
    }

    async fn add_certified_addrs(&self, _record: &PeerRecord, _ttl: Duration) {}

    async fn peer_record(&self, _peer: &PeerId) -> Option<PeerRecord> {
        None
    }

    fn tag_peer(&self, _peer: &PeerId, _tag: &str, _weight: usize) {}
    fn untag_peer(&self, _peer: &PeerId, _tag: &str) {}
}

#[derive(Default)]
struct ScoreMap(Mutex<HashMap<PeerId, f64>>);

impl ScoreMap {
    fn set(&self, peer: PeerId, score: f64) {
        self.0.lock().unwrap().insert(peer, score);
    }
}

impl ScoreProvider for ScoreMap {
    fn score(&self, peer: &PeerId) -> f64 {
        self.0.lock().unwrap().get(peer).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn peer(seed: u8) -> PeerId {
    PeerId::from_bytes([seed; 32])
}

fn fast_config() -> GossipConfig {
    GossipConfig {
        heartbeat_initial_delay: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(40),
        ..Default::default()
    }
}

async fn add_peer_with_version(
    router: &Router,
    peer: PeerId,
    version: ProtocolVersion,
    topics: &[&str],
) -> mpsc::Receiver<Frame> {
    let rx = router.add_peer(peer, version).await.unwrap();
    if !topics.is_empty() {
        router
            .handle_frame(
                peer,
                Frame::subscriptions(topics.iter().map(|t| t.to_string()), true),
            )
            .await
            .unwrap();
    }
    rx
}

async fn add_gossip_peer(router: &Router, peer: PeerId, topics: &[&str]) -> mpsc::Receiver<Frame> {
    add_peer_with_version(router, peer, ProtocolVersion::GossipV11, topics).await
}

async fn drain_frames(rx: &mut mpsc::Receiver<Frame>, window: Duration) -> Vec<Frame> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        frames.push(frame);
    }
    frames
}

async fn wait_for_frame<F>(
    rx: &mut mpsc::Receiver<Frame>,
    window: Duration,
    pred: F,
) -> Option<Frame>
where
    F: Fn(&Frame) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if pred(&frame) {
            return Some(frame);
        }
    }
    None
}

fn payload_count(frames: &[Frame], id: &MessageId) -> usize {
    frames
        .iter()
        .flat_map(|f| &f.publish)
        .filter(|m| m.message_id() == *id)
        .count()
}

fn has_graft(frames: &[Frame], topic: &str) -> bool {
    frames
        .iter()
        .filter_map(|f| f.control.as_ref())
        .flat_map(|c| &c.graft)
        .any(|g| g.topic == topic)
}

fn prune_count(frames: &[Frame], topic: &str) -> usize {
    frames
        .iter()
        .filter_map(|f| f.control.as_ref())
        .flat_map(|c| &c.prune)
        .filter(|p| p.topic == topic)
        .count()
}

fn graft_frame(topic: &str) -> Frame {
    Frame::control(ControlBlock {
        graft: vec![ControlGraft {
            topic: topic.to_string(),
        }],
        ..Default::default()
    })
}

fn iwant_frame(ids: Vec<MessageId>) -> Frame {
    Frame::control(ControlBlock {
        iwant: vec![ControlIWant { message_ids: ids }],
        ..Default::default()
    })
}

// =============================================================================
// Join / Leave
// =============================================================================

#[tokio::test]
async fn join_builds_mesh_from_subscribed_peers() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(7)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut receivers = Vec::new();
    for seed in 1..=3 {
        receivers.push((
            peer(seed),
            add_gossip_peer(&router, peer(seed), &["blocks"]).await,
        ));
    }

    router.join("blocks").await.unwrap();

    let mesh = router.mesh_peers("blocks").await;
    assert_eq!(mesh.len(), 3);
    assert_eq!(router.joined_topics().await, vec!["blocks".to_string()]);

    for (p, rx) in &mut receivers {
        let frames = drain_frames(rx, Duration::from_millis(80)).await;
        assert!(
            has_graft(&frames, "blocks"),
            "{p:?} should have received a graft"
        );
    }

    router.quit().await;
}

#[tokio::test]
async fn join_leave_round_trip_rebuilds_mesh() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(7)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut rx = add_gossip_peer(&router, peer(1), &["blocks"]).await;

    router.join("blocks").await.unwrap();
    assert_eq!(router.mesh_peers("blocks").await, vec![peer(1)]);

    router.leave("blocks").await.unwrap();
    assert!(router.mesh_peers("blocks").await.is_empty());
    assert!(router.joined_topics().await.is_empty());

    let frames = drain_frames(&mut rx, Duration::from_millis(80)).await;
    assert!(has_graft(&frames, "blocks"));
    assert_eq!(prune_count(&frames, "blocks"), 1);

    // a subsequent join rebuilds the mesh
    router.join("blocks").await.unwrap();
    assert_eq!(router.mesh_peers("blocks").await, vec![peer(1)]);

    router.quit().await;
}

#[tokio::test]
async fn leave_is_idempotent() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    router.leave("never-joined").await.unwrap();
    assert!(router.joined_topics().await.is_empty());
    router.quit().await;
}

// =============================================================================
// Publish path
// =============================================================================

#[tokio::test]
async fn local_publish_reaches_every_mesh_peer_once() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(3)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut receivers = Vec::new();
    for seed in 1..=3 {
        receivers.push(add_gossip_peer(&router, peer(seed), &["blocks"]).await);
    }
    router.join("blocks").await.unwrap();

    let id = router.publish("blocks", b"hello mesh".to_vec()).await.unwrap();

    for rx in &mut receivers {
        let frames = drain_frames(rx, Duration::from_millis(80)).await;
        assert_eq!(payload_count(&frames, &id), 1);
    }

    router.quit().await;
}

#[tokio::test]
async fn publish_rejects_invalid_topic() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    assert!(router.publish("", b"data".to_vec()).await.is_err());
    assert!(router.publish("bad\u{7}topic", b"data".to_vec()).await.is_err());
    router.quit().await;
}

#[tokio::test]
async fn forward_excludes_relay_and_origin() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(3)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let origin = peer(1);
    let relay = peer(2);
    let witness = peer(3);

    let mut rx_origin = add_gossip_peer(&router, origin, &["blocks"]).await;
    let mut rx_relay = add_gossip_peer(&router, relay, &["blocks"]).await;
    let mut rx_witness = add_gossip_peer(&router, witness, &["blocks"]).await;
    router.join("blocks").await.unwrap();

    let msg = PayloadMessage {
        from: origin,
        seqno: 42,
        topics: vec!["blocks".into()],
        data: b"relayed".to_vec(),
        signature: vec![],
    };
    let id = msg.message_id();
    router.forward(relay, msg).await.unwrap();

    let frames = drain_frames(&mut rx_witness, Duration::from_millis(80)).await;
    assert_eq!(payload_count(&frames, &id), 1);

    let frames = drain_frames(&mut rx_origin, Duration::from_millis(50)).await;
    assert_eq!(payload_count(&frames, &id), 0, "origin must not get its own message");

    let frames = drain_frames(&mut rx_relay, Duration::from_millis(50)).await;
    assert_eq!(payload_count(&frames, &id), 0, "relay must not get the message back");

    router.quit().await;
}

// =============================================================================
// Fanout
// =============================================================================

#[tokio::test]
async fn publish_without_join_uses_fanout_and_expires() {
    let config = GossipConfig {
        fanout_ttl: Duration::from_millis(120),
        ..fast_config()
    };
    let router = RouterBuilder::new(peer(0))
        .config(config)
        .rng_seed(11)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut receivers = Vec::new();
    for seed in 1..=8 {
        receivers.push(add_gossip_peer(&router, peer(seed), &["prices"]).await);
    }

    let id = router.publish("prices", b"quote".to_vec()).await.unwrap();

    let fanout = router.fanout_peers("prices").await;
    assert!(!fanout.is_empty());
    assert!(fanout.len() <= 6);
    assert!(router.mesh_peers("prices").await.is_empty());

    let mut delivered = 0;
    for rx in &mut receivers {
        let frames = drain_frames(rx, Duration::from_millis(50)).await;
        delivered += payload_count(&frames, &id);
    }
    assert_eq!(delivered, fanout.len());

    // without further publishes the entry expires after the ttl
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(router.fanout_peers("prices").await.is_empty());

    router.quit().await;
}

#[tokio::test]
async fn join_converts_fanout_into_mesh() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(11)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    for seed in 1..=4 {
        add_gossip_peer(&router, peer(seed), &["prices"]).await;
    }

    router.publish("prices", b"quote".to_vec()).await.unwrap();
    let fanout = router.fanout_peers("prices").await;
    assert!(!fanout.is_empty());

    router.join("prices").await.unwrap();
    let mesh = router.mesh_peers("prices").await;
    for p in &fanout {
        assert!(mesh.contains(p), "fanout peer should carry over into the mesh");
    }
    assert!(router.fanout_peers("prices").await.is_empty());

    router.quit().await;
}

// =============================================================================
// Direct and legacy peers
// =============================================================================

#[tokio::test]
async fn direct_peer_always_delivered_never_meshed() {
    let direct = peer(9);
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .direct_peers([direct])
        .rng_seed(5)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut rx_direct = add_gossip_peer(&router, direct, &["blocks"]).await;
    let mut _rx_other = add_gossip_peer(&router, peer(1), &["blocks"]).await;
    router.join("blocks").await.unwrap();

    // a few heartbeats must never pull the direct peer into the mesh
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!router.mesh_peers("blocks").await.contains(&direct));

    let id = router.publish("blocks", b"to-direct".to_vec()).await.unwrap();
    let frames = drain_frames(&mut rx_direct, Duration::from_millis(80)).await;
    assert_eq!(payload_count(&frames, &id), 1);

    // grafting from a direct peer is refused with a PRUNE
    router.handle_frame(direct, graft_frame("blocks")).await.unwrap();
    let frames = drain_frames(&mut rx_direct, Duration::from_millis(50)).await;
    assert_eq!(prune_count(&frames, "blocks"), 1);
    assert!(!router.mesh_peers("blocks").await.contains(&direct));

    router.quit().await;
}

#[tokio::test]
async fn floodsub_peer_receives_payloads_but_no_control() {
    let flood = peer(7);
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(5)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut rx_flood = add_peer_with_version(&router, flood, ProtocolVersion::Floodsub, &["blocks"]).await;
    add_gossip_peer(&router, peer(1), &["blocks"]).await;
    router.join("blocks").await.unwrap();

    assert!(!router.mesh_peers("blocks").await.contains(&flood));

    let id = router.publish("blocks", b"legacy".to_vec()).await.unwrap();

    // allow a few heartbeats so gossip emission would have happened
    tokio::time::sleep(Duration::from_millis(150)).await;
    let frames = drain_frames(&mut rx_flood, Duration::from_millis(50)).await;
    assert_eq!(payload_count(&frames, &id), 1);
    assert!(
        frames.iter().all(|f| f.control.is_none()),
        "legacy flood peers must only receive payload frames"
    );

    router.quit().await;
}

#[tokio::test]
async fn flood_publish_reaches_all_peers_above_threshold() {
    let scores = Arc::new(ScoreMap::default());
    let low = peer(4);
    scores.set(low, -60.0); // below the default publish threshold of -50

    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .flood_publish(true)
        .score(scores.clone())
        .rng_seed(5)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mut rx_low = add_gossip_peer(&router, low, &["blocks"]).await;
    // more subscribers than the mesh degree, so flood must exceed the mesh
    let mut receivers = Vec::new();
    for seed in 10..=17 {
        receivers.push(add_gossip_peer(&router, peer(seed), &["blocks"]).await);
    }
    router.join("blocks").await.unwrap();

    let id = router.publish("blocks", b"flooded".to_vec()).await.unwrap();

    let mut delivered = 0;
    for rx in &mut receivers {
        let frames = drain_frames(rx, Duration::from_millis(50)).await;
        delivered += payload_count(&frames, &id);
    }
    assert_eq!(delivered, 8, "flood publish must reach every eligible subscriber");

    let frames = drain_frames(&mut rx_low, Duration::from_millis(50)).await;
    assert_eq!(payload_count(&frames, &id), 0, "low-score peer must be skipped");

    router.quit().await;
}

// =============================================================================
// Gossip pull cycle
// =============================================================================

#[tokio::test]
async fn non_mesh_peer_pulls_payload_through_ihave_iwant() {
    // degree one keeps the second subscriber out of the mesh
    let config = GossipConfig {
        mesh_n: 1,
        mesh_n_low: 1,
        mesh_n_high: 1,
        mesh_n_score: 1,
        // a deep history keeps the payload pullable for the whole test
        history_length: 10,
        heartbeat_initial_delay: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(60),
        ..Default::default()
    };
    let router = RouterBuilder::new(peer(0))
        .config(config)
        .rng_seed(13)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let mesh_peer = peer(1);
    let mut rx_mesh = add_gossip_peer(&router, mesh_peer, &["blocks"]).await;
    router.join("blocks").await.unwrap();
    assert_eq!(router.mesh_peers("blocks").await, vec![mesh_peer]);

    let lazy_peer = peer(2);
    let mut rx_lazy = add_gossip_peer(&router, lazy_peer, &["blocks"]).await;

    let id = router.publish("blocks", b"pull me".to_vec()).await.unwrap();

    // the mesh peer gets the push...
    let frames = drain_frames(&mut rx_mesh, Duration::from_millis(80)).await;
    assert_eq!(payload_count(&frames, &id), 1);

    // ...the lazy peer gets an advertisement at the next heartbeat
    let ihave = wait_for_frame(&mut rx_lazy, Duration::from_millis(500), |f| {
        f.control
            .as_ref()
            .is_some_and(|c| c.ihave.iter().any(|i| i.message_ids.contains(&id)))
    })
    .await
    .expect("lazy peer should receive an IHAVE advertisement");
    assert!(ihave.publish.is_empty());

    // pulling with IWANT yields the payload
    router.handle_frame(lazy_peer, iwant_frame(vec![id])).await.unwrap();
    let frames = drain_frames(&mut rx_lazy, Duration::from_millis(80)).await;
    assert_eq!(payload_count(&frames, &id), 1);

    router.quit().await;
}

// =============================================================================
// Degree maintenance
// =============================================================================

#[tokio::test]
async fn oversized_mesh_is_pruned_back_to_target_degree() {
    // late first heartbeat so all grafts land before maintenance runs
    let config = GossipConfig {
        heartbeat_initial_delay: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(40),
        ..Default::default()
    };
    let router = RouterBuilder::new(peer(0))
        .config(config)
        .rng_seed(17)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    router.join("blocks").await.unwrap();

    // 20 peers graft in, far beyond the upper bound of 12
    for seed in 1..=20 {
        add_gossip_peer(&router, peer(seed), &["blocks"]).await;
        router.handle_frame(peer(seed), graft_frame("blocks")).await.unwrap();
    }
    assert_eq!(router.mesh_peers("blocks").await.len(), 20);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mesh = router.mesh_peers("blocks").await;
    assert_eq!(mesh.len(), 6, "heartbeat must prune an oversized mesh to D");

    router.quit().await;
}

#[tokio::test]
async fn undersized_mesh_is_topped_up_at_heartbeat() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(17)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    router.join("blocks").await.unwrap();
    assert!(router.mesh_peers("blocks").await.is_empty());

    // subscribers appear after the join
    for seed in 1..=8 {
        add_gossip_peer(&router, peer(seed), &["blocks"]).await;
    }

    tokio::time::sleep(Duration::from_millis(120)).await;
    let mesh = router.mesh_peers("blocks").await;
    assert_eq!(mesh.len(), 6, "heartbeat must graft up to D");

    router.quit().await;
}

// =============================================================================
// Send coalescer
// =============================================================================

#[tokio::test]
async fn dropped_prune_is_retained_and_flushed_later() {
    // a single-slot outbound queue forces the second control frame to drop
    let config = GossipConfig {
        peer_outbound_queue_size: 1,
        heartbeat_initial_delay: Duration::from_millis(60),
        heartbeat_interval: Duration::from_millis(60),
        ..Default::default()
    };
    let router = RouterBuilder::new(peer(0))
        .config(config)
        .rng_seed(29)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let target = peer(1);
    let mut rx = add_gossip_peer(&router, target, &["blocks"]).await;
    router.join("blocks").await.unwrap(); // graft fills the queue
    router.leave("blocks").await.unwrap(); // prune dropped, retained

    let first = rx.recv().await.unwrap();
    assert!(
        first
            .control
            .as_ref()
            .is_some_and(|c| c.graft.iter().any(|g| g.topic == "blocks")),
        "the queued frame is the join graft"
    );

    // the retained prune rides the next heartbeat flush
    let flushed = wait_for_frame(&mut rx, Duration::from_millis(500), |f| {
        f.control
            .as_ref()
            .is_some_and(|c| c.prune.iter().any(|p| p.topic == "blocks"))
    })
    .await;
    assert!(flushed.is_some(), "dropped prune must be re-sent by a flush");

    router.quit().await;
}

// =============================================================================
// Registry probes
// =============================================================================

#[tokio::test]
async fn enough_peers_counts_mesh_and_flood_subscribers() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(19)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    assert!(!router.enough_peers("blocks", 0).await);

    add_gossip_peer(&router, peer(1), &["blocks"]).await;
    add_gossip_peer(&router, peer(2), &["blocks"]).await;
    add_peer_with_version(&router, peer(3), ProtocolVersion::Floodsub, &["blocks"]).await;
    router.join("blocks").await.unwrap();

    assert!(router.enough_peers("blocks", 3).await);
    assert!(!router.enough_peers("blocks", 0).await); // default bound is D_lo = 5

    router.quit().await;
}

#[tokio::test]
async fn accept_from_applies_graylist_threshold_except_direct() {
    let scores = Arc::new(ScoreMap::default());
    let shunned = peer(1);
    let trusted_direct = peer(2);
    scores.set(shunned, -150.0);
    scores.set(trusted_direct, -150.0);

    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .score(scores.clone())
        .direct_peers([trusted_direct])
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    assert!(!router.accept_from(shunned).await);
    assert!(router.accept_from(trusted_direct).await);
    assert!(router.accept_from(peer(3)).await);

    router.quit().await;
}

#[tokio::test]
async fn removed_peer_disappears_from_all_state() {
    let router = RouterBuilder::new(peer(0))
        .config(fast_config())
        .rng_seed(23)
        .spawn(Arc::new(MockHost::default()))
        .unwrap();

    let gone = peer(1);
    add_gossip_peer(&router, gone, &["blocks"]).await;
    router.join("blocks").await.unwrap();
    assert_eq!(router.mesh_peers("blocks").await, vec![gone]);

    router.remove_peer(gone).await.unwrap();
    assert!(router.mesh_peers("blocks").await.is_empty());

    // heartbeats must not resurrect it
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(router.mesh_peers("blocks").await.is_empty());

    router.quit().await;
}
