//! Consumed interfaces of the payment engine.
//!
//! Channel state machines, the path-finder, onion cryptography, the chain
//! watcher and the host's payment listeners all live outside this crate;
//! the engine talks to them through the traits below. Each trait has a
//! no-op or OS-backed implementation so components can be tested in
//! isolation.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use crate::core::outbound::model::{
    AddHtlcCmd, ChannelId, ChannelUpdate, DecryptedFailurePacket, FindRouteRequest, GraphEdge,
    HopSharedSecret, OutgoingHtlc, PacketAndSecrets, RemoteFulfill, RouteResponse,
};
use crate::core::outbound::sender::SenderSnapshot;
use crate::primitives::Msat;

// ============================================================================
// Channels
// ============================================================================

/// Handle to a locally controlled channel plus its current commitments
/// view. Queries are synchronous reads of local channel state; the only
/// command is submitting an add-HTLC, whose outcome comes back later as a
/// reject or fulfill event.
#[async_trait]
pub trait ChannelHandle: std::fmt::Debug + Send + Sync {
    fn channel_id(&self) -> ChannelId;
    fn remote_node_id(&self) -> PublicKey;
    fn available_for_send(&self) -> Msat;
    fn max_send_in_flight(&self) -> Msat;
    fn min_sendable(&self) -> Msat;
    /// HTLCs currently outgoing on this channel.
    fn outgoing(&self) -> Vec<OutgoingHtlc>;
    fn is_operational_and_open(&self) -> bool;
    fn is_operational_and_sleeping(&self) -> bool;
    /// Hands an add-HTLC command to the channel. Must not block on the
    /// peer; resolution arrives as a later event.
    async fn submit_add_htlc(&self, cmd: AddHtlcCmd) -> Result<()>;
}

/// Shared channel reference as stored in commands and part statuses.
pub type ChanRef = Arc<dyn ChannelHandle>;

// ============================================================================
// Path-finder
// ============================================================================

/// The external Dijkstra path-finder over the routing graph. Also the sink
/// for graph knowledge the engine picks up along the way: assisted edges
/// from invoices and channel updates carried inside failure packets.
#[async_trait]
pub trait PathFinder: Send + Sync {
    async fn find_route(&self, request: FindRouteRequest) -> Result<RouteResponse>;
    async fn learn_update(&self, update: ChannelUpdate);
    async fn learn_edge(&self, edge: GraphEdge);
}

// ============================================================================
// Sphinx primitives
// ============================================================================

/// Why an onion could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionBuildError {
    /// Accumulated hop payloads exceed the fixed packet size.
    PayloadTooLarge { size: usize, max: usize },
    /// A payload could not be encoded.
    Encoding(String),
}

impl std::fmt::Display for OnionBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnionBuildError::PayloadTooLarge { size, max } => {
                write!(f, "onion payload too large: {} > {}", size, max)
            }
            OnionBuildError::Encoding(e) => write!(f, "onion payload encoding failed: {}", e),
        }
    }
}

impl std::error::Error for OnionBuildError {}

/// Why a failure packet could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecryptError {
    /// No shared secret produced a valid mac.
    BadMac,
    /// The packet was structurally invalid.
    Truncated,
}

impl std::fmt::Display for FailureDecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureDecryptError::BadMac => write!(f, "failure packet mac did not verify"),
            FailureDecryptError::Truncated => write!(f, "failure packet truncated"),
        }
    }
}

impl std::error::Error for FailureDecryptError {}

/// BOLT-04 sphinx primitives. Implementations wrap an onion crypto
/// library; the engine itself never touches key derivation.
pub trait SphinxCrypto: Send + Sync {
    /// Builds the layered packet for `hop_nodes` with one encoded payload
    /// per hop, authenticated against `assoc_data` (the payment hash).
    ///
    /// The returned packet's `public_key` must be the public key of
    /// `session_key`: it is what identifies the part.
    fn build_onion(
        &self,
        session_key: &SecretKey,
        hop_nodes: &[PublicKey],
        hop_payloads: &[Vec<u8>],
        assoc_data: &[u8; 32],
    ) -> std::result::Result<PacketAndSecrets, OnionBuildError>;

    /// Peels an encrypted failure blob with the shared secrets of the
    /// route it travelled back along.
    fn decrypt_failure(
        &self,
        reason: &[u8],
        shared_secrets: &[HopSharedSecret],
    ) -> std::result::Result<DecryptedFailurePacket, FailureDecryptError>;

    /// Verifies the signature of a channel update against the node that
    /// allegedly produced it.
    fn is_node_update_sig_ok(&self, update: &ChannelUpdate, node_id: &PublicKey) -> bool;
}

// ============================================================================
// Chain tip
// ============================================================================

/// Current best block height, read from the local chain watcher.
pub trait ChainTip: Send + Sync {
    fn height(&self) -> u32;
}

/// A fixed chain tip, for tests and offline tooling.
#[derive(Debug, Clone, Copy)]
pub struct FixedChainTip(pub u32);

impl ChainTip for FixedChainTip {
    fn height(&self) -> u32 {
        self.0
    }
}

// ============================================================================
// Entropy
// ============================================================================

/// Source of session keys and channel-ordering randomness. Injected so
/// tests can run the engine fully deterministically.
pub trait EntropySource: Send + Sync {
    /// A fresh onion session key. Its public key becomes the part id.
    fn fresh_session_key(&self) -> SecretKey;

    /// Shuffles channel candidates before assignment. Only the ordering of
    /// non-direct channels is affected by this; direct channels are sorted
    /// to the front afterwards.
    fn shuffle_candidates(&self, candidates: &mut [(ChanRef, Msat)]);
}

/// Production entropy backed by the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fresh_session_key(&self) -> SecretKey {
        SecretKey::new(&mut OsRng)
    }

    fn shuffle_candidates(&self, candidates: &mut [(ChanRef, Msat)]) {
        candidates.shuffle(&mut OsRng);
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Host callbacks for payment lifecycle events. All methods default to
/// no-ops so hosts implement only what they care about. Implementations
/// should be fast and non-blocking.
#[async_trait]
pub trait PaymentListener: Send + Sync {
    /// The first preimage for the payment arrived. The snapshot is taken
    /// before the fulfilled part is dropped, so routes are still intact.
    async fn got_first_preimage(&self, _snapshot: SenderSnapshot, _fulfill: RemoteFulfill) {}

    /// Every part has cleared and no channel holds an HTLC with this tag
    /// anymore; the payment is definitively done.
    async fn whole_payment_succeeded(&self, _snapshot: SenderSnapshot) {}

    /// The payment is aborted and nothing remains in any channel.
    async fn whole_payment_failed(&self, _snapshot: SenderSnapshot) {}

    /// The sender was removed from the master registry.
    async fn sender_removed(&self, _snapshot: SenderSnapshot) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPaymentListener;

#[async_trait]
impl PaymentListener for NoOpPaymentListener {}
