//! Peer exchange connect dispatcher.
//!
//! Pruned-peer hand-offs and direct-peer reconnects land on a bounded queue
//! consumed by a fixed pool of connector workers. Enqueuing never blocks the
//! router's event loop: when the queue is full the remaining candidates are
//! simply dropped. Connection failures are logged and forgotten.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::host::{Connectedness, HostNetwork};
use crate::identity::PeerId;
use crate::wire;

/// TTL for certified addresses learned through PX records.
/// Short on purpose: a pruned peer should re-learn addresses through normal
/// discovery once connected.
const CERTIFIED_ADDR_TTL: Duration = Duration::from_secs(120);

/// A single connect attempt, optionally carrying an encoded signed record.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub peer: PeerId,
    /// Encoded [`crate::identity::PeerRecord`]; validated before use.
    pub signed_record: Option<Vec<u8>>,
}

/// Handle to the connector pool. Cloneable; dropping every handle shuts the
/// workers down once the queue drains.
#[derive(Clone)]
pub struct PxDispatcher {
    tx: mpsc::Sender<ConnectRequest>,
}

impl PxDispatcher {
    /// Spawn `connectors` workers draining a queue of `capacity` requests.
    pub fn spawn(
        host: Arc<dyn HostNetwork>,
        connectors: usize,
        capacity: usize,
        connection_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..connectors {
            let host = host.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    match request {
                        Some(request) => connect_one(host.as_ref(), request, connection_timeout).await,
                        None => break,
                    }
                }
            });
        }

        Self { tx }
    }

    /// Non-blocking enqueue. Returns false when the queue is full (or the
    /// pool is gone); callers drop the remainder of their batch in that case.
    pub fn try_enqueue(&self, request: ConnectRequest) -> bool {
        self.tx.try_send(request).is_ok()
    }
}

async fn connect_one(
    host: &dyn HostNetwork,
    request: ConnectRequest,
    connection_timeout: Duration,
) {
    let ConnectRequest {
        peer,
        signed_record,
    } = request;

    if host.connectedness(&peer).await == Connectedness::Connected {
        return;
    }

    if let Some(bytes) = signed_record {
        let record = match wire::decode_peer_record(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    error = %err,
                    "malformed peer record obtained through px"
                );
                return;
            }
        };
        if let Err(err) = record.verify(&peer) {
            warn!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                error = %err,
                "bogus peer record obtained through px"
            );
            return;
        }
        host.add_certified_addrs(&record, CERTIFIED_ADDR_TTL).await;
    }

    debug!(peer = %hex::encode(&peer.as_bytes()[..8]), "px connecting");
    match tokio::time::timeout(connection_timeout, host.connect(&peer)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                error = %err,
                "px connect failed"
            );
        }
        Err(_) => {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                "px connect timed out"
            );
        }
    }
}
