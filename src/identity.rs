//! Peer identities and signed peer records.
//!
//! A [`PeerId`] is an opaque 32-byte identifier; in practice it is an Ed25519
//! public key, which lets peer records be verified without a separate key
//! distribution channel. The router itself never interprets the bytes.
//!
//! [`PeerRecord`]s are the certified address envelopes handed around through
//! peer exchange: a record is only usable if its signature verifies under the
//! key of the peer it claims to describe.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for peer record signatures.
/// Prevents cross-protocol signature replay.
pub const PEER_RECORD_SIGNATURE_DOMAIN: &[u8] = b"meshcast-peer-record-v1:";

/// Opaque peer identifier (32 bytes, Ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 keypair backing a peer identity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

/// Errors from peer record validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// The record describes a different peer than the one it was claimed for.
    PeerMismatch,
    MissingSignature,
    MalformedSignature,
    /// The record's key bytes do not form a valid public key.
    BadKey,
    SignatureMismatch,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::PeerMismatch => write!(f, "record peer id does not match claimed peer"),
            RecordError::MissingSignature => write!(f, "record carries no signature"),
            RecordError::MalformedSignature => write!(f, "record signature is malformed"),
            RecordError::BadKey => write!(f, "record peer id is not a valid public key"),
            RecordError::SignatureMismatch => write!(f, "record signature does not verify"),
        }
    }
}

impl std::error::Error for RecordError {}

/// A signed address record for a peer, exchanged through PRUNE peer exchange.
///
/// The signature covers the peer id, the sequence number and every address,
/// so an intermediary cannot splice addresses into someone else's record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub addrs: Vec<String>,
    /// Monotonic sequence number; newer records supersede older ones.
    pub seq: u64,
    pub signature: Vec<u8>,
}

impl PeerRecord {
    /// Canonical bytes under the signature. The domain tag leads the payload,
    /// so a record signature can never double as any other protocol message.
    ///
    /// Layout: domain || peer(32) || seq(8) || addr_count(4) || (addr_len(4) || addr)*
    fn signing_payload(peer: &PeerId, addrs: &[String], seq: u64) -> Vec<u8> {
        let mut payload = PEER_RECORD_SIGNATURE_DOMAIN.to_vec();
        payload.extend_from_slice(peer.as_bytes());
        payload.extend_from_slice(&seq.to_le_bytes());
        payload.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
        for addr in addrs {
            payload.extend_from_slice(&(addr.len() as u32).to_le_bytes());
            payload.extend_from_slice(addr.as_bytes());
        }
        payload
    }

    /// Create a record signed by the local keypair.
    pub fn signed(keypair: &Keypair, addrs: Vec<String>, seq: u64) -> Self {
        let peer = keypair.peer_id();
        let signature = keypair
            .sign(&Self::signing_payload(&peer, &addrs, seq))
            .to_bytes()
            .to_vec();
        Self {
            peer,
            addrs,
            seq,
            signature,
        }
    }

    /// Verify the record's envelope signature and that it describes `claimed`.
    pub fn verify(&self, claimed: &PeerId) -> Result<(), RecordError> {
        if self.peer != *claimed {
            return Err(RecordError::PeerMismatch);
        }
        if self.signature.is_empty() {
            return Err(RecordError::MissingSignature);
        }
        let key = VerifyingKey::try_from(self.peer.as_bytes().as_slice())
            .map_err(|_| RecordError::BadKey)?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| RecordError::MalformedSignature)?;
        key.verify_strict(
            &Self::signing_payload(&self.peer, &self.addrs, self.seq),
            &signature,
        )
        .map_err(|_| RecordError::SignatureMismatch)
    }
}
