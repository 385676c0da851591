//! Domain model for the outgoing payment engine.
//!
//! Everything here is plain data: payment identity, the immutable send
//! command, graph edges and routes, per-part statuses and the failure sums
//! accumulated while a payment is being driven.

use std::collections::HashSet;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::core::outbound::provider::ChanRef;
use crate::core::tlv::TlvStream;
use crate::primitives::{ChainExpiry, CltvExpiry, CltvExpiryDelta, Msat, Ppm, ShortChannelId};
use crate::util;

// ============================================================================
// Identity
// ============================================================================

/// 32-byte identifier of a locally controlled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// How a payment entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentTag {
    /// Originated by the local wallet.
    LocallySent,
    /// Relayed on behalf of a trampoline sender; identity-only here, the
    /// engine dispatches outer routes for it like any other payment.
    TrampolineRouted,
}

impl std::fmt::Display for PaymentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentTag::LocallySent => write!(f, "locally_sent"),
            PaymentTag::TrampolineRouted => write!(f, "trampoline_routed"),
        }
    }
}

/// Unique identity of one logical payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullPaymentTag {
    pub payment_hash: [u8; 32],
    pub payment_secret: [u8; 32],
    pub tag: PaymentTag,
}

impl std::fmt::Display for FullPaymentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tag, hex::encode(&self.payment_hash[..8]))
    }
}

/// A part id is the public key of the part's onion session keypair.
pub type PartId = PublicKey;

// ============================================================================
// Send command
// ============================================================================

/// How the requested amount relates to the whole multi-part payment.
/// `my_part` is what this process must deliver; `total_sum` binds all
/// senders of the payment together in the final hop payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub total_sum: Msat,
    pub my_part: Msat,
}

/// Route search knobs handed through to the path-finder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConf {
    pub init_route_max_length: u32,
    pub route_max_cltv: CltvExpiryDelta,
}

impl Default for RouterConf {
    fn default() -> Self {
        Self {
            init_route_max_length: 6,
            route_max_cltv: CltvExpiryDelta(2016),
        }
    }
}

/// Immutable description of one outgoing payment. Everything the sender
/// FSM needs to drive the payment lives here; the FSM never mutates it.
#[derive(Debug, Clone)]
pub struct SendPayment {
    pub full_tag: FullPaymentTag,
    pub split: SplitInfo,
    pub target_node_id: PublicKey,
    pub chain_expiry: ChainExpiry,
    pub router_conf: RouterConf,
    pub total_fee_reserve: Msat,
    pub allowed_chans: Vec<ChanRef>,
    pub outer_payment_secret: [u8; 32],
    pub payee_metadata: Option<Vec<u8>>,
    /// Extra graph edges (e.g. from invoice routing hints) pushed to the
    /// path-finder before routing starts.
    pub assisted_edges: Vec<GraphEdge>,
    pub onion_tlvs: TlvStream,
    pub user_custom_tlvs: TlvStream,
    /// Run failure-ledger restoration before this payment is assigned.
    pub clear_failures: bool,
}

// ============================================================================
// Graph
// ============================================================================

/// Directed edge identity in the external routing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelDesc {
    pub short_channel_id: ShortChannelId,
    pub from: PublicKey,
    pub to: PublicKey,
}

impl ChannelDesc {
    /// The direction of this edge, independent of which endpoint announced
    /// it: both directions of one scid count failures separately.
    pub fn direction(&self) -> Direction {
        Direction {
            short_channel_id: self.short_channel_id,
            one_to_two: self.from < self.to,
        }
    }
}

/// Edge identity plus its announced capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescAndCapacity {
    pub desc: ChannelDesc,
    pub capacity: Msat,
}

/// One directed side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Direction {
    pub short_channel_id: ShortChannelId,
    pub one_to_two: bool,
}

/// A signed routing-policy statement for one directed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub short_channel_id: ShortChannelId,
    pub timestamp: u64,
    pub enabled: bool,
    pub cltv_expiry_delta: CltvExpiryDelta,
    pub htlc_minimum: Msat,
    pub htlc_maximum: Msat,
    pub fee_base: Msat,
    pub fee_proportional: Ppm,
    /// Signature over the update digest by the announcing node.
    pub signature: Vec<u8>,
}

impl ChannelUpdate {
    /// Relay fee charged by this edge for forwarding `amount`.
    pub fn fee_for(&self, amount: Msat) -> Msat {
        self.fee_base + self.fee_proportional.apply_to(amount)
    }

    /// Policy equality: same routing behaviour regardless of when or where
    /// in a route the update was observed. Timestamp and signature are
    /// deliberately not compared.
    pub fn same_policy_as(&self, other: &ChannelUpdate) -> bool {
        self.short_channel_id == other.short_channel_id
            && self.enabled == other.enabled
            && self.cltv_expiry_delta == other.cltv_expiry_delta
            && self.htlc_minimum == other.htlc_minimum
            && self.htlc_maximum == other.htlc_maximum
            && self.fee_base == other.fee_base
            && self.fee_proportional == other.fee_proportional
    }
}

/// A routable edge: identity, capacity and current policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub desc: ChannelDesc,
    pub capacity: Msat,
    pub update: ChannelUpdate,
}

impl GraphEdge {
    pub fn desc_and_capacity(&self) -> DescAndCapacity {
        DescAndCapacity {
            desc: self.desc,
            capacity: self.capacity,
        }
    }
}

/// An ordered sequence of edges from the local node to the target. The
/// first hop is always the fabricated local edge over one of our own
/// channels and charges no fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hops: Vec<GraphEdge>,
}

impl Route {
    /// Total relay fee for delivering `amount` to the target, folding
    /// per-hop fees right to left. The local first hop is free.
    pub fn fee_for(&self, amount: Msat) -> Msat {
        let mut acc = amount;
        for edge in self.hops.iter().skip(1).rev() {
            acc = acc + edge.update.fee_for(acc);
        }
        acc.saturating_sub(amount)
    }

    /// The node a given hop node forwards through, i.e. the edge departing
    /// from `node` on this route.
    pub fn edge_from(&self, node: &PublicKey) -> Option<&GraphEdge> {
        self.hops.iter().find(|edge| edge.desc.from == *node)
    }

    /// The second-to-last node of the route. Used as the best-guess blame
    /// target when a failure cannot be attributed precisely.
    pub fn penultimate_node(&self) -> Option<PublicKey> {
        match self.hops.len() {
            0 => None,
            1 => Some(self.hops[0].desc.to),
            n => Some(self.hops[n - 2].desc.to),
        }
    }

    pub fn target(&self) -> Option<PublicKey> {
        self.hops.last().map(|edge| edge.desc.to)
    }
}

// ============================================================================
// Route requests
// ============================================================================

/// Search limits for one route request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteParams {
    /// Remaining fee budget of the payment; routes costing more are
    /// unacceptable.
    pub fee_reserve: Msat,
    pub route_max_length: u32,
    pub route_max_cltv: CltvExpiryDelta,
}

/// A sender's request for a route for one part.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub full_tag: FullPaymentTag,
    pub part_id: PartId,
    /// Stand-in source key; the route starts at the fabricated local edge.
    pub source: PublicKey,
    pub target: PublicKey,
    pub amount: Msat,
    pub local_edge: GraphEdge,
    pub params: RouteParams,
}

/// What the master actually forwards to the path-finder: the sender's
/// request plus the failure-ledger ignore sets computed at that moment.
#[derive(Debug, Clone)]
pub struct FindRouteRequest {
    pub request: RouteRequest,
    pub ignore_nodes: HashSet<PublicKey>,
    pub ignore_channels: HashSet<ChannelDesc>,
    pub ignore_directions: HashSet<Direction>,
}

/// Path-finder verdict for one request.
#[derive(Debug, Clone)]
pub enum RouteResponse {
    Found {
        full_tag: FullPaymentTag,
        part_id: PartId,
        route: Route,
    },
    NoRoute {
        full_tag: FullPaymentTag,
        part_id: PartId,
    },
}

impl RouteResponse {
    pub fn full_tag(&self) -> FullPaymentTag {
        match self {
            RouteResponse::Found { full_tag, .. } => *full_tag,
            RouteResponse::NoRoute { full_tag, .. } => *full_tag,
        }
    }
}

// ============================================================================
// Onion containers
// ============================================================================

/// An encrypted sphinx packet ready to ride an HTLC. The packet's public
/// key is the part's session public key, which is why it doubles as the
/// part id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionPacket {
    pub version: u8,
    pub public_key: PublicKey,
    pub payload: Vec<u8>,
    pub hmac: [u8; 32],
}

/// Per-hop shared secret paired with the hop node, kept around to decrypt
/// a failure packet coming back along the route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSharedSecret {
    pub secret: [u8; 32],
    pub node_id: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAndSecrets {
    pub packet: OnionPacket,
    pub shared_secrets: Vec<HopSharedSecret>,
}

/// The add-HTLC command handed to a channel.
#[derive(Debug, Clone)]
pub struct AddHtlcCmd {
    pub full_tag: FullPaymentTag,
    pub first_amount: Msat,
    pub first_expiry: CltvExpiry,
    pub packet_and_secrets: PacketAndSecrets,
    pub final_payload: TlvStream,
}

impl AddHtlcCmd {
    pub fn part_id(&self) -> PartId {
        self.packet_and_secrets.packet.public_key
    }
}

/// Compact view of an HTLC a channel currently has outgoing. Channels
/// report these so the engine can reconcile its local part bookkeeping
/// with what actually made it into a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingHtlc {
    pub full_tag: FullPaymentTag,
    pub part_id: PartId,
    pub amount: Msat,
}

// ============================================================================
// Channel resolutions
// ============================================================================

/// Why a channel refused to carry an add-HTLC command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRejectReason {
    /// The command can never be sent on this channel (wrong amount range,
    /// feature mismatch). Retrying elsewhere is pointless.
    InPrincipleNotSendable,
    /// The channel is currently offline.
    ChannelOffline,
    /// A transient capacity or slot shortage.
    TemporarilyUnavailable,
}

impl std::fmt::Display for LocalRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalRejectReason::InPrincipleNotSendable => write!(f, "in_principle_not_sendable"),
            LocalRejectReason::ChannelOffline => write!(f, "channel_offline"),
            LocalRejectReason::TemporarilyUnavailable => write!(f, "temporarily_unavailable"),
        }
    }
}

/// A channel declined our command before any HTLC went out.
#[derive(Debug, Clone)]
pub struct LocalReject {
    pub reason: LocalRejectReason,
    pub cmd: AddHtlcCmd,
}

/// The remote peer revealed the preimage for one of our HTLCs.
#[derive(Debug, Clone)]
pub struct RemoteFulfill {
    pub preimage: [u8; 32],
    pub our_add: AddHtlcCmd,
}

/// The remote peer failed one of our HTLCs.
#[derive(Debug, Clone)]
pub enum RemoteReject {
    /// Ordinary failure carrying an onion-encrypted failure packet.
    UpdateFail { reason: Vec<u8>, our_add: AddHtlcCmd },
    /// The peer could not parse our onion at all.
    UpdateMalform { our_add: AddHtlcCmd },
}

impl RemoteReject {
    pub fn our_add(&self) -> &AddHtlcCmd {
        match self {
            RemoteReject::UpdateFail { our_add, .. } => our_add,
            RemoteReject::UpdateMalform { our_add } => our_add,
        }
    }
}

/// A decrypted failure message, already stripped to what the retry policy
/// cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMessage {
    /// The destination gave up waiting for the remaining parts.
    PaymentTimeout,
    /// A hop rejected the HTLC and attached its current channel policy.
    Update { update: ChannelUpdate },
    /// A node-level failure; the origin itself is misbehaving or down.
    Node,
    /// Anything else, kept by failure code for diagnostics.
    Other { code: u16 },
}

/// Decrypted sphinx failure packet attributed to its origin hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFailurePacket {
    pub origin_node: PublicKey,
    pub failure: FailureMessage,
}

/// Tags present across all channels, reported by the host whenever channel
/// contents change. Used to decide when a payment has fully left the
/// channel layer.
#[derive(Debug, Clone, Default)]
pub struct InFlightBag {
    pub tags: HashSet<FullPaymentTag>,
}

impl InFlightBag {
    pub fn contains(&self, tag: &FullPaymentTag) -> bool {
        self.tags.contains(tag)
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Locally decided failure kinds, stringly tagged for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFailureKind {
    NoRoutesFound,
    NotEnoughFunds,
    PaymentNotSendable,
    RunOutOfRetryAttempts,
    RunOutOfCapableChannels,
    NodeCouldNotParseOnion,
    NotRetryingNoDetails,
    OnionCreationFailure,
    TimedOut,
}

impl std::fmt::Display for LocalFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            LocalFailureKind::NoRoutesFound => "NO_ROUTES_FOUND",
            LocalFailureKind::NotEnoughFunds => "NOT_ENOUGH_FUNDS",
            LocalFailureKind::PaymentNotSendable => "PAYMENT_NOT_SENDABLE",
            LocalFailureKind::RunOutOfRetryAttempts => "RUN_OUT_OF_RETRY_ATTEMPTS",
            LocalFailureKind::RunOutOfCapableChannels => "RUN_OUT_OF_CAPABLE_CHANNELS",
            LocalFailureKind::NodeCouldNotParseOnion => "NODE_COULD_NOT_PARSE_ONION",
            LocalFailureKind::NotRetryingNoDetails => "NOT_RETRYING_NO_DETAILS",
            LocalFailureKind::OnionCreationFailure => "ONION_CREATION_FAILURE",
            LocalFailureKind::TimedOut => "TIMED_OUT",
        };
        write!(f, "{}", tag)
    }
}

/// One failed attempt, accumulated per payment and surfaced to listeners.
#[derive(Debug, Clone)]
pub enum PaymentFailure {
    Local {
        kind: LocalFailureKind,
        amount: Msat,
    },
    Remote {
        route: Route,
        packet: DecryptedFailurePacket,
    },
    UnreadableRemote {
        route: Route,
    },
}

impl std::fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentFailure::Local { kind, amount } => write!(f, "{} at {}", kind, amount),
            PaymentFailure::Remote { packet, .. } => {
                write!(f, "remote failure from {}", packet.origin_node)
            }
            PaymentFailure::UnreadableRemote { route } => {
                write!(f, "unreadable remote failure over {} hops", route.hops.len())
            }
        }
    }
}

// ============================================================================
// Part status
// ============================================================================

/// A dispatched part: the command we handed to a channel and the route it
/// took, with the route fee frozen at dispatch time.
#[derive(Debug, Clone)]
pub struct Flight {
    pub cmd: AddHtlcCmd,
    pub route: Route,
    pub fee: Msat,
}

/// Lifecycle of one payment part. A part's id is derived from its current
/// onion session key, so replacing the key replaces the part id.
#[derive(Debug, Clone)]
pub enum PartStatus {
    /// No routable channel right now; parked until a channel comes online.
    WaitForChanOnline { onion_key: SecretKey, amount: Msat },
    /// A channel is reserved. `flight` is `None` while a route is awaited
    /// and `Some` once the HTLC command has been dispatched.
    WaitForRouteOrInFlight {
        onion_key: SecretKey,
        amount: Msat,
        chan: ChanRef,
        flight: Option<Flight>,
        fees_tried: Vec<Msat>,
        local_failed: Vec<ChannelId>,
        remote_attempts: u32,
    },
}

impl PartStatus {
    pub fn part_id(&self) -> PartId {
        util::part_id_for(self.onion_key())
    }

    pub fn onion_key(&self) -> &SecretKey {
        match self {
            PartStatus::WaitForChanOnline { onion_key, .. } => onion_key,
            PartStatus::WaitForRouteOrInFlight { onion_key, .. } => onion_key,
        }
    }

    pub fn amount(&self) -> Msat {
        match self {
            PartStatus::WaitForChanOnline { amount, .. } => *amount,
            PartStatus::WaitForRouteOrInFlight { amount, .. } => *amount,
        }
    }

    /// True once the HTLC command has actually been handed to a channel.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PartStatus::WaitForRouteOrInFlight { flight: Some(_), .. }
        )
    }

    pub fn is_waiting_online(&self) -> bool {
        matches!(self, PartStatus::WaitForChanOnline { .. })
    }

    pub fn flight(&self) -> Option<&Flight> {
        match self {
            PartStatus::WaitForRouteOrInFlight { flight, .. } => flight.as_ref(),
            PartStatus::WaitForChanOnline { .. } => None,
        }
    }
}

// ============================================================================
// Sender phase
// ============================================================================

/// FSM phase of one payment sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    Init,
    Pending,
    Aborted,
    Succeeded,
}

impl SenderPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SenderPhase::Aborted | SenderPhase::Succeeded)
    }
}

impl std::fmt::Display for SenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderPhase::Init => write!(f, "init"),
            SenderPhase::Pending => write!(f, "pending"),
            SenderPhase::Aborted => write!(f, "aborted"),
            SenderPhase::Succeeded => write!(f, "succeeded"),
        }
    }
}
