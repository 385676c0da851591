//! End-to-end payment scenarios against mock providers.
//!
//! These tests drive the full engine: master state machine, per-payment
//! senders, sendable calculation, failure ledger and onion building, with
//! the path-finder, channels, sphinx crypto and listeners replaced by
//! in-memory mocks. Most scenarios run the master synchronously through
//! [`MasterState::drive`] so event ordering is fully deterministic; the
//! worker loop itself is exercised at the end with real tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use ln_outbound::core::outbound::master::{
    MasterConfig, MasterEvent, MasterOutput, MasterState, Notification, PaymentMaster,
};
use ln_outbound::core::outbound::model::{
    AddHtlcCmd, ChannelDesc, ChannelId, ChannelUpdate, DecryptedFailurePacket, FailureMessage,
    FindRouteRequest, FullPaymentTag, GraphEdge, HopSharedSecret, InFlightBag, LocalFailureKind,
    OnionPacket, OutgoingHtlc, PacketAndSecrets, PartId, PaymentFailure, PaymentTag, RemoteFulfill,
    RemoteReject, Route, RouteResponse, SendPayment, SenderPhase, SplitInfo,
};
use ln_outbound::core::outbound::provider::{
    ChanRef, ChannelHandle, EntropySource, FailureDecryptError, FixedChainTip, OnionBuildError,
    PathFinder, PaymentListener, SphinxCrypto,
};
use ln_outbound::core::outbound::sender::SenderSnapshot;
use ln_outbound::primitives::{ChainExpiry, CltvExpiryDelta, Msat, Ppm, ShortChannelId};
use ln_outbound::util;

// ============================================================================
// Fixtures
// ============================================================================

fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn node(byte: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::signing_only(), &key(byte))
}

fn payment_tag(preimage: &[u8; 32]) -> FullPaymentTag {
    FullPaymentTag {
        payment_hash: sha256::Hash::hash(preimage).to_byte_array(),
        payment_secret: [55; 32],
        tag: PaymentTag::LocallySent,
    }
}

fn policy(scid: u64, fee_base: u64) -> ChannelUpdate {
    ChannelUpdate {
        short_channel_id: ShortChannelId(scid),
        timestamp: 1,
        enabled: true,
        cltv_expiry_delta: CltvExpiryDelta(40),
        htlc_minimum: Msat(1000),
        htlc_maximum: Msat(100_000_000),
        fee_base: Msat(fee_base),
        fee_proportional: Ppm(0),
        signature: vec![0; 64],
    }
}

fn remote_edge(scid: u64, from: PublicKey, to: PublicKey, fee_base: u64) -> GraphEdge {
    GraphEdge {
        desc: ChannelDesc {
            short_channel_id: ShortChannelId(scid),
            from,
            to,
        },
        capacity: Msat(10_000_000),
        update: policy(scid, fee_base),
    }
}

fn send_cmd(full_tag: FullPaymentTag, my_part: u64, target: PublicKey, chans: Vec<ChanRef>) -> SendPayment {
    SendPayment {
        full_tag,
        split: SplitInfo {
            total_sum: Msat(my_part),
            my_part: Msat(my_part),
        },
        target_node_id: target,
        chain_expiry: ChainExpiry::Delta(CltvExpiryDelta(144)),
        router_conf: Default::default(),
        total_fee_reserve: Msat(5_000),
        allowed_chans: chans,
        outer_payment_secret: [3; 32],
        payee_metadata: None,
        assisted_edges: Vec::new(),
        onion_tlvs: Default::default(),
        user_custom_tlvs: Default::default(),
        clear_failures: false,
    }
}

// ============================================================================
// Mock channel
// ============================================================================

#[derive(Debug, Default)]
struct ChannelInner {
    available: Msat,
    max_in_flight: Msat,
    min_sendable: Msat,
    open: bool,
    sleeping: bool,
    outgoing: Vec<OutgoingHtlc>,
    submitted: Vec<AddHtlcCmd>,
}

/// In-memory channel. Cloning shares state so the test keeps one handle
/// while the engine holds another.
#[derive(Debug, Clone)]
struct SimChannel {
    id: ChannelId,
    remote: PublicKey,
    inner: Arc<Mutex<ChannelInner>>,
}

impl SimChannel {
    fn new(id_byte: u8, remote: PublicKey, available: u64) -> Self {
        Self {
            id: ChannelId([id_byte; 32]),
            remote,
            inner: Arc::new(Mutex::new(ChannelInner {
                available: Msat(available),
                max_in_flight: Msat(available),
                min_sendable: Msat(1000),
                open: true,
                sleeping: false,
                outgoing: Vec::new(),
                submitted: Vec::new(),
            })),
        }
    }

    fn asleep(self) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
            inner.sleeping = true;
        }
        self
    }

    fn submitted(&self) -> Vec<AddHtlcCmd> {
        self.inner.lock().unwrap().submitted.clone()
    }

    fn push_outgoing(&self, full_tag: FullPaymentTag, part_id: PartId, amount: Msat) {
        self.inner
            .lock()
            .unwrap()
            .outgoing
            .push(OutgoingHtlc { full_tag, part_id, amount });
    }

    fn clear_outgoing(&self) {
        self.inner.lock().unwrap().outgoing.clear();
    }
}

#[async_trait]
impl ChannelHandle for SimChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn remote_node_id(&self) -> PublicKey {
        self.remote
    }

    fn available_for_send(&self) -> Msat {
        self.inner.lock().unwrap().available
    }

    fn max_send_in_flight(&self) -> Msat {
        self.inner.lock().unwrap().max_in_flight
    }

    fn min_sendable(&self) -> Msat {
        self.inner.lock().unwrap().min_sendable
    }

    fn outgoing(&self) -> Vec<OutgoingHtlc> {
        self.inner.lock().unwrap().outgoing.clone()
    }

    fn is_operational_and_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn is_operational_and_sleeping(&self) -> bool {
        self.inner.lock().unwrap().sleeping
    }

    async fn submit_add_htlc(&self, cmd: AddHtlcCmd) -> Result<()> {
        self.inner.lock().unwrap().submitted.push(cmd);
        Ok(())
    }
}

// ============================================================================
// Deterministic entropy and scripted sphinx
// ============================================================================

#[derive(Debug, Default)]
struct SeqEntropy {
    counter: AtomicU8,
}

impl EntropySource for SeqEntropy {
    fn fresh_session_key(&self) -> SecretKey {
        key(self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1))
    }

    fn shuffle_candidates(&self, _candidates: &mut [(ChanRef, Msat)]) {}
}

#[derive(Default)]
struct SphinxInner {
    decrypts: HashMap<Vec<u8>, DecryptedFailurePacket>,
    bad_sig_nodes: HashSet<PublicKey>,
}

#[derive(Default)]
struct ScriptedSphinx {
    inner: Mutex<SphinxInner>,
}

impl ScriptedSphinx {
    fn script_decrypt(&self, reason: Vec<u8>, packet: DecryptedFailurePacket) {
        self.inner.lock().unwrap().decrypts.insert(reason, packet);
    }

    fn mark_bad_signature(&self, node_id: PublicKey) {
        self.inner.lock().unwrap().bad_sig_nodes.insert(node_id);
    }
}

impl SphinxCrypto for ScriptedSphinx {
    fn build_onion(
        &self,
        session_key: &SecretKey,
        hop_nodes: &[PublicKey],
        hop_payloads: &[Vec<u8>],
        _assoc_data: &[u8; 32],
    ) -> std::result::Result<PacketAndSecrets, OnionBuildError> {
        Ok(PacketAndSecrets {
            packet: OnionPacket {
                version: 0,
                public_key: util::part_id_for(session_key),
                payload: hop_payloads.concat(),
                hmac: [0; 32],
            },
            shared_secrets: hop_nodes
                .iter()
                .enumerate()
                .map(|(i, node_id)| HopSharedSecret {
                    secret: [i as u8; 32],
                    node_id: *node_id,
                })
                .collect(),
        })
    }

    fn decrypt_failure(
        &self,
        reason: &[u8],
        _shared_secrets: &[HopSharedSecret],
    ) -> std::result::Result<DecryptedFailurePacket, FailureDecryptError> {
        self.inner
            .lock()
            .unwrap()
            .decrypts
            .get(reason)
            .cloned()
            .ok_or(FailureDecryptError::BadMac)
    }

    fn is_node_update_sig_ok(&self, _update: &ChannelUpdate, node_id: &PublicKey) -> bool {
        !self.inner.lock().unwrap().bad_sig_nodes.contains(node_id)
    }
}

// ============================================================================
// Scripted path-finder and capturing listener (worker tests)
// ============================================================================

struct ScriptedPathFinder {
    /// Routes handed out in order; when exhausted, responds NoRoute.
    routes: Mutex<Vec<Route>>,
    seen: Mutex<Vec<FindRouteRequest>>,
}

impl ScriptedPathFinder {
    fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: Mutex::new(routes),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PathFinder for ScriptedPathFinder {
    async fn find_route(&self, request: FindRouteRequest) -> Result<RouteResponse> {
        self.seen.lock().unwrap().push(request.clone());
        let next = {
            let mut routes = self.routes.lock().unwrap();
            if routes.is_empty() {
                None
            } else {
                Some(routes.remove(0))
            }
        };
        Ok(match next {
            Some(mut route) => {
                // Splice the caller's local edge in as the first hop.
                route.hops.insert(0, request.request.local_edge.clone());
                RouteResponse::Found {
                    full_tag: request.request.full_tag,
                    part_id: request.request.part_id,
                    route,
                }
            }
            None => RouteResponse::NoRoute {
                full_tag: request.request.full_tag,
                part_id: request.request.part_id,
            },
        })
    }

    async fn learn_update(&self, _update: ChannelUpdate) {}

    async fn learn_edge(&self, _edge: GraphEdge) {}
}

/// Forwards every notification into an mpsc channel the test can await.
struct ChannelListener {
    tx: tokio::sync::mpsc::UnboundedSender<&'static str>,
    snapshots: Mutex<Vec<SenderSnapshot>>,
}

impl ChannelListener {
    fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<&'static str>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                snapshots: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }
}

#[async_trait]
impl PaymentListener for ChannelListener {
    async fn got_first_preimage(&self, snapshot: SenderSnapshot, _fulfill: RemoteFulfill) {
        self.snapshots.lock().unwrap().push(snapshot);
        let _ = self.tx.send("first_preimage");
    }

    async fn whole_payment_succeeded(&self, snapshot: SenderSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
        let _ = self.tx.send("succeeded");
    }

    async fn whole_payment_failed(&self, snapshot: SenderSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
        let _ = self.tx.send("failed");
    }
}

// ============================================================================
// Synchronous harness
// ============================================================================

struct Harness {
    state: MasterState,
    sphinx: Arc<ScriptedSphinx>,
}

impl Harness {
    fn new() -> Self {
        let sphinx = Arc::new(ScriptedSphinx::default());
        let state = MasterState::new(
            MasterConfig::default(),
            Arc::new(SeqEntropy::default()),
            sphinx.clone(),
            Arc::new(FixedChainTip(800_000)),
        );
        Self { state, sphinx }
    }

    fn register(&mut self, full_tag: FullPaymentTag) {
        self.state.drive(MasterEvent::CreateSender {
            full_tag,
            listeners: Vec::new(),
        });
    }
}

fn find_requests(outputs: &[MasterOutput]) -> Vec<&FindRouteRequest> {
    outputs
        .iter()
        .filter_map(|output| match output {
            MasterOutput::FindRoute(request) => Some(request),
            _ => None,
        })
        .collect()
}

fn dispatched(outputs: &[MasterOutput]) -> Vec<AddHtlcCmd> {
    outputs
        .iter()
        .filter_map(|output| match output {
            MasterOutput::DispatchHtlc { cmd, .. } => Some(cmd.clone()),
            _ => None,
        })
        .collect()
}

fn notifications(outputs: &[MasterOutput]) -> Vec<&Notification> {
    outputs
        .iter()
        .filter_map(|output| match output {
            MasterOutput::Notify { notification, .. } => Some(notification),
            _ => None,
        })
        .collect()
}

/// Responds to the pending route request with a route through the given
/// remote hops, splicing in the request's local edge.
fn respond_with_route(
    state: &mut MasterState,
    request: &FindRouteRequest,
    remote_hops: Vec<GraphEdge>,
) -> Vec<MasterOutput> {
    let mut hops = vec![request.request.local_edge.clone()];
    hops.extend(remote_hops);
    state.drive(MasterEvent::RouteResponse(RouteResponse::Found {
        full_tag: request.request.full_tag,
        part_id: request.request.part_id,
        route: Route { hops },
    }))
}

// ============================================================================
// Scenario 1: single channel, success
// ============================================================================

#[test]
fn test_single_channel_success() {
    let preimage = [42u8; 32];
    let full_tag = payment_tag(&preimage);
    let target = node(99);
    let mut harness = Harness::new();
    let chan = SimChannel::new(1, node(10), 1_000_000);
    let chan_ref: ChanRef = Arc::new(chan.clone());

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![chan_ref],
    )));

    // Exactly one part, one route request for the whole amount.
    let requests = find_requests(&outputs);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.amount, Msat(500_000));
    let snapshot = harness.state.sender_snapshot(&full_tag).unwrap();
    assert_eq!(snapshot.parts.len(), 1);

    // A route with 2_000 msat fee produces a 502_000 first-hop command.
    let outputs = respond_with_route(
        &mut harness.state,
        &requests[0].clone(),
        vec![remote_edge(2, node(10), target, 2_000)],
    );
    let cmds = dispatched(&outputs);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].first_amount, Msat(502_000));

    // The channel holds the HTLC until the remote fulfills.
    chan.push_outgoing(full_tag, cmds[0].part_id(), cmds[0].first_amount);
    let outputs = harness.state.drive(MasterEvent::RemoteFulfill(RemoteFulfill {
        preimage,
        our_add: cmds[0].clone(),
    }));
    match notifications(&outputs)[..] {
        [Notification::FirstPreimage { snapshot, .. }] => {
            assert_eq!(snapshot.used_fee, Msat(2_000));
            assert_eq!(snapshot.phase, SenderPhase::Pending);
        }
        ref other => panic!("expected first preimage only, got {} notifications", other.len()),
    }

    // Once the channel clears, the bag snapshot finalises the payment.
    chan.clear_outgoing();
    let outputs = harness
        .state
        .drive(MasterEvent::InFlightPayments(InFlightBag::default()));
    match notifications(&outputs)[..] {
        [Notification::WholePaymentSucceeded { snapshot }] => {
            assert_eq!(snapshot.phase, SenderPhase::Succeeded);
            assert!(snapshot.parts.is_empty());
        }
        ref other => panic!("expected success, got {} notifications", other.len()),
    }

    // The bag poke is idempotent: no second notification.
    let outputs = harness
        .state
        .drive(MasterEvent::InFlightPayments(InFlightBag::default()));
    assert!(notifications(&outputs).is_empty());
}

// ============================================================================
// Scenario 2: split across two channels
// ============================================================================

#[test]
fn test_split_across_two_channels() {
    let preimage = [43u8; 32];
    let full_tag = payment_tag(&preimage);
    let target = node(99);
    let mut harness = Harness::new();
    // Both cover 300_000 after the 5_000 fee reserve; c2 goes straight to
    // the target and must be drained first.
    let c1 = SimChannel::new(1, node(10), 305_000);
    let c2 = SimChannel::new(2, target, 305_000);
    let c1_ref: ChanRef = Arc::new(c1.clone());
    let c2_ref: ChanRef = Arc::new(c2.clone());

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![c1_ref, c2_ref],
    )));

    let snapshot = harness.state.sender_snapshot(&full_tag).unwrap();
    assert_eq!(snapshot.parts.len(), 2);
    let mut amounts: HashMap<ChannelId, Msat> = HashMap::new();
    for part in snapshot.parts.values() {
        if let ln_outbound::core::outbound::model::PartStatus::WaitForRouteOrInFlight {
            chan,
            amount,
            ..
        } = part
        {
            amounts.insert(chan.channel_id(), *amount);
        }
    }
    // The direct channel carries everything it can, the other the rest.
    assert_eq!(amounts[&ChannelId([2; 32])], Msat(300_000));
    assert_eq!(amounts[&ChannelId([1; 32])], Msat(200_000));

    // Route and dispatch both parts, largest first.
    let requests = find_requests(&outputs);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.amount, Msat(300_000));
    // The direct part's route is just the local edge to the target.
    let outputs = respond_with_route(&mut harness.state, &requests[0].clone(), vec![]);
    let first_cmds = dispatched(&outputs);
    assert_eq!(first_cmds.len(), 1);
    assert_eq!(first_cmds[0].first_amount, Msat(300_000));

    let requests: Vec<FindRouteRequest> =
        find_requests(&outputs).into_iter().cloned().collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.amount, Msat(200_000));
    let outputs = respond_with_route(
        &mut harness.state,
        &requests[0],
        vec![remote_edge(21, node(10), target, 0)],
    );
    let second_cmds = dispatched(&outputs);
    assert_eq!(second_cmds.len(), 1);

    // One preimage settles the whole payment.
    let outputs = harness.state.drive(MasterEvent::RemoteFulfill(RemoteFulfill {
        preimage,
        our_add: first_cmds[0].clone(),
    }));
    // The second part is still in flight, so no success yet.
    match notifications(&outputs)[..] {
        [Notification::FirstPreimage { .. }] => {}
        ref other => panic!("expected first preimage only, got {} notifications", other.len()),
    }

    let outputs = harness.state.drive(MasterEvent::RemoteFulfill(RemoteFulfill {
        preimage,
        our_add: second_cmds[0].clone(),
    }));
    assert!(matches!(
        notifications(&outputs)[..],
        [Notification::WholePaymentSucceeded { .. }]
    ));
}

// ============================================================================
// Scenario 3: halving on no route
// ============================================================================

#[test]
fn test_halving_on_no_route() {
    let full_tag = payment_tag(&[44u8; 32]);
    let target = node(99);
    let mut harness = Harness::new();
    let chan: ChanRef = Arc::new(SimChannel::new(1, node(10), 1_000_000));

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![chan],
    )));
    let request = find_requests(&outputs)[0].clone();

    let outputs = harness
        .state
        .drive(MasterEvent::RouteResponse(RouteResponse::NoRoute {
            full_tag,
            part_id: request.request.part_id,
        }));

    // Two new parts covering the halves.
    let snapshot = harness.state.sender_snapshot(&full_tag).unwrap();
    assert_eq!(snapshot.parts.len(), 2);
    let amounts: Vec<Msat> = snapshot.parts.values().map(|part| part.amount()).collect();
    assert_eq!(amounts, vec![Msat(250_000), Msat(250_000)]);
    // And routing resumes for one of them.
    assert_eq!(find_requests(&outputs).len(), 1);
}

// ============================================================================
// Scenario 4: remote update failure, retry on another channel
// ============================================================================

#[test]
fn test_remote_update_failure_retries_elsewhere() {
    let full_tag = payment_tag(&[45u8; 32]);
    let target = node(99);
    let hop = node(10);
    let mut harness = Harness::new();
    let c1 = SimChannel::new(1, hop, 1_000_000);
    let c2 = SimChannel::new(2, node(11), 1_000_000);
    let c1_ref: ChanRef = Arc::new(c1.clone());
    let c2_ref: ChanRef = Arc::new(c2.clone());

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![c1_ref, c2_ref],
    )));
    let request = find_requests(&outputs)[0].clone();
    let failing_edge = remote_edge(7, hop, target, 100);
    let outputs = respond_with_route(&mut harness.state, &request, vec![failing_edge.clone()]);
    let cmd = dispatched(&outputs).remove(0);
    let original_part = cmd.part_id();

    // The hop fails the HTLC, attaching its unchanged, validly signed
    // policy: the channel is judged imbalanced at this amount.
    harness.sphinx.script_decrypt(
        vec![0xEE],
        DecryptedFailurePacket {
            origin_node: hop,
            failure: FailureMessage::Update {
                update: failing_edge.update.clone(),
            },
        },
    );
    let outputs = harness.state.drive(MasterEvent::RemoteReject(RemoteReject::UpdateFail {
        reason: vec![0xEE],
        our_add: cmd,
    }));

    // Ledger: the edge is remembered at its in-flight amount, the
    // direction counter is bumped.
    let dac = failing_edge.desc_and_capacity();
    let failed_at = harness.state.ledger().chan_failed_at(&dac).unwrap();
    assert_eq!(failed_at.amount, Msat(500_000));
    assert_eq!(
        harness.state.ledger().direction_failures(&dac.desc.direction()),
        1
    );

    // The part is retried with a rotated session key.
    let snapshot = harness.state.sender_snapshot(&full_tag).unwrap();
    assert_eq!(snapshot.parts.len(), 1);
    let (part_id, part) = snapshot.parts.iter().next().unwrap();
    assert_ne!(*part_id, original_part);
    let ln_outbound::core::outbound::model::PartStatus::WaitForRouteOrInFlight {
        remote_attempts,
        flight,
        ..
    } = part
    else {
        panic!("expected a routable part");
    };
    assert_eq!(*remote_attempts, 1);
    assert!(flight.is_none());
    // The remote failure is preserved for diagnostics.
    assert!(matches!(snapshot.failures[0], PaymentFailure::Remote { .. }));
    // And a new route request went out for the retry.
    assert_eq!(find_requests(&outputs).len(), 1);
}

// ============================================================================
// Scenario 5: timed out waiting for a channel
// ============================================================================

#[test]
fn test_timed_out_waiting_for_online() {
    let full_tag = payment_tag(&[46u8; 32]);
    let mut harness = Harness::new();
    let chan: ChanRef = Arc::new(SimChannel::new(1, node(10), 1_000_000).asleep());

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        node(99),
        vec![chan],
    )));

    // The whole amount is parked and the abort timer armed.
    let generation = outputs
        .iter()
        .find_map(|output| match output {
            MasterOutput::ArmAbortTimer { generation, .. } => Some(*generation),
            _ => None,
        })
        .expect("timer must be armed");
    let snapshot = harness.state.sender_snapshot(&full_tag).unwrap();
    assert!(snapshot.parts.values().all(|part| part.is_waiting_online()));

    // No ChanGotOnline arrives before the timer fires.
    let outputs = harness.state.drive(MasterEvent::AbortTimerFired {
        full_tag,
        generation,
    });
    match notifications(&outputs)[..] {
        [Notification::WholePaymentFailed { snapshot }] => {
            assert_eq!(snapshot.phase, SenderPhase::Aborted);
            assert!(matches!(
                snapshot.failures[0],
                PaymentFailure::Local {
                    kind: LocalFailureKind::TimedOut,
                    amount: Msat(500_000),
                }
            ));
        }
        ref other => panic!("expected failure, got {} notifications", other.len()),
    }
}

// ============================================================================
// Scenario 6: invalid failure signature
// ============================================================================

#[test]
fn test_invalid_failure_signature_excludes_node() {
    let full_tag = payment_tag(&[47u8; 32]);
    let target = node(99);
    let hop = node(10);
    let mut harness = Harness::new();
    let c1: ChanRef = Arc::new(SimChannel::new(1, hop, 1_000_000));
    let c2: ChanRef = Arc::new(SimChannel::new(2, node(11), 1_000_000));

    harness.register(full_tag);
    let outputs = harness.state.drive(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![c1, c2],
    )));
    let request = find_requests(&outputs)[0].clone();
    let outputs = respond_with_route(
        &mut harness.state,
        &request,
        vec![remote_edge(7, hop, target, 100)],
    );
    let cmd = dispatched(&outputs).remove(0);

    // The hop returns an update whose signature does not verify.
    harness.sphinx.mark_bad_signature(hop);
    harness.sphinx.script_decrypt(
        vec![0xDD],
        DecryptedFailurePacket {
            origin_node: hop,
            failure: FailureMessage::Update {
                update: policy(7, 100),
            },
        },
    );
    let outputs = harness.state.drive(MasterEvent::RemoteReject(RemoteReject::UpdateFail {
        reason: vec![0xDD],
        our_add: cmd,
    }));

    // Severe penalty: well past the strange-failure threshold.
    let expected = harness.state.cfg().max_strange_node_failures * 32;
    assert_eq!(harness.state.ledger().node_failures(&hop), expected);

    // The retry's route request carries the node in its ignore set.
    let requests = find_requests(&outputs);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].ignore_nodes.contains(&hop));
}

// ============================================================================
// Worker loop end to end
// ============================================================================

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_worker_drives_payment_to_success() {
    let preimage = [48u8; 32];
    let full_tag = payment_tag(&preimage);
    let target = node(99);
    let chan = SimChannel::new(1, node(10), 1_000_000);
    let chan_ref: ChanRef = Arc::new(chan.clone());

    let state = MasterState::new(
        MasterConfig::default(),
        Arc::new(SeqEntropy::default()),
        Arc::new(ScriptedSphinx::default()),
        Arc::new(FixedChainTip(800_000)),
    );
    let path_finder = Arc::new(ScriptedPathFinder::new(vec![Route {
        hops: vec![remote_edge(2, node(10), target, 2_000)],
    }]));
    let (master, _worker) = PaymentMaster::spawn(state, path_finder.clone());

    let (listener, mut events) = ChannelListener::new();
    master.process(MasterEvent::CreateSender {
        full_tag,
        listeners: vec![listener.clone()],
    });
    master.process(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        target,
        vec![chan_ref],
    )));

    // The engine routes and dispatches on its own.
    wait_until(|| !chan.submitted().is_empty()).await;
    let cmd = chan.submitted().remove(0);
    assert_eq!(cmd.first_amount, Msat(502_000));

    master.process(MasterEvent::RemoteFulfill(RemoteFulfill {
        preimage,
        our_add: cmd,
    }));
    master.process(MasterEvent::InFlightPayments(InFlightBag::default()));

    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(first, Some("first_preimage"));
    let second = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(second, Some("succeeded"));

    let snapshot = master.sender_snapshot(&full_tag).await.unwrap();
    assert_eq!(snapshot.phase, SenderPhase::Succeeded);
    // Exactly one route request reached the path-finder.
    assert_eq!(path_finder.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_abort_timer_fails_parked_payment() {
    let full_tag = payment_tag(&[49u8; 32]);
    let chan: ChanRef = Arc::new(SimChannel::new(1, node(10), 1_000_000).asleep());

    let cfg = MasterConfig {
        abort_timeout: Duration::from_millis(50),
        ..MasterConfig::default()
    };
    let state = MasterState::new(
        cfg,
        Arc::new(SeqEntropy::default()),
        Arc::new(ScriptedSphinx::default()),
        Arc::new(FixedChainTip(800_000)),
    );
    let path_finder = Arc::new(ScriptedPathFinder::new(Vec::new()));
    let (master, _worker) = PaymentMaster::spawn(state, path_finder);

    let (listener, mut events) = ChannelListener::new();
    master.process(MasterEvent::CreateSender {
        full_tag,
        listeners: vec![listener.clone()],
    });
    master.process(MasterEvent::SendPayment(send_cmd(
        full_tag,
        500_000,
        node(99),
        vec![chan],
    )));

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("failed"));
    let snapshot = listener.snapshots.lock().unwrap().last().unwrap().clone();
    assert!(matches!(
        snapshot.failures[0],
        PaymentFailure::Local {
            kind: LocalFailureKind::TimedOut,
            ..
        }
    ));
}
