//! Payment Master FSM.
//!
//! The singleton coordinating all payment senders: it owns the sender
//! registry and the failure ledger, serialises route requests so the
//! path-finder sees at most one at a time, and fans channel resolutions
//! and online events out to the senders that own them.
//!
//! State mutation is strictly single-threaded: [`MasterState::handle`]
//! runs to completion without yielding and never performs I/O. The
//! [`PaymentMaster`] wrapper feeds it from an event queue consumed by one
//! worker task and executes the produced outputs after the state lock is
//! released, so external calls can never re-enter a handler.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::secp256k1::PublicKey;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::outbound::ledger::FailureLedger;
use crate::core::outbound::model::{
    AddHtlcCmd, ChannelDesc, ChannelUpdate, DescAndCapacity, FindRouteRequest, FullPaymentTag,
    GraphEdge, InFlightBag, LocalReject, RemoteFulfill, RemoteReject, RouteRequest, RouteResponse,
    SendPayment,
};
use crate::core::outbound::provider::{
    ChainTip, ChanRef, EntropySource, PathFinder, PaymentListener, SphinxCrypto,
};
use crate::core::outbound::sendable;
use crate::core::outbound::sender::{
    LedgerOp, PaymentSender, SenderCtx, SenderSnapshot, SenderStep,
};
use crate::primitives::Msat;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Full-recovery window for failed-at-amount ledger entries.
    pub failed_chan_recovery: Duration,
    /// Node penalty threshold; also the increment unit for severe blame.
    pub max_strange_node_failures: u32,
    /// Directed-edge failure threshold.
    pub max_direction_failures: u32,
    /// How often one part may be retried after a remote failure.
    pub max_remote_attempts: u32,
    /// Per-channel HTLC slot budget, capping how far parts may split.
    pub max_in_channel_htlcs: u32,
    /// Floor below which halving refuses to split a part further.
    pub min_part_amount: Msat,
    /// How long parked parts may wait for a channel to come online.
    pub abort_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            failed_chan_recovery: Duration::from_secs(3600),
            max_strange_node_failures: 5,
            max_direction_failures: 5,
            max_remote_attempts: 5,
            max_in_channel_htlcs: 10,
            min_part_amount: Msat(10_000),
            abort_timeout: Duration::from_secs(90),
        }
    }
}

impl MasterConfig {
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            abort_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

// ============================================================================
// Events, outputs
// ============================================================================

/// Everything the master reacts to: host commands, path-finder responses,
/// channel resolutions and self-posted continuations.
pub enum MasterEvent {
    /// Register a sender for a payment before anything else touches it.
    CreateSender {
        full_tag: FullPaymentTag,
        listeners: Vec<Arc<dyn PaymentListener>>,
    },
    /// Drop a sender from the registry.
    RemoveSender { full_tag: FullPaymentTag },
    SendPayment(SendPayment),
    /// Some channel became operational; parked parts may proceed.
    ChanGotOnline,
    /// Poke every sender to surface its next route request.
    AskForRoute,
    /// A sender wants a route for one part.
    RouteRequest(RouteRequest),
    RouteResponse(RouteResponse),
    /// Ledger: a directed external channel failed at its current load.
    ChannelFailedAtAmount(DescAndCapacity),
    /// Ledger: penalise a node.
    NodeFailed { node_id: PublicKey, increment: u32 },
    /// Ledger: disable an edge until the next reduction.
    ChannelNotRoutable(ChannelDesc),
    /// Host snapshot of HTLC tags across all channels.
    InFlightPayments(InFlightBag),
    LocalReject(LocalReject),
    RemoteFulfill(RemoteFulfill),
    RemoteReject(RemoteReject),
    /// Self-posted: split an amount in two and re-assign.
    CutIntoHalves { full_tag: FullPaymentTag, amount: Msat },
    /// Upstream gave up on the payment.
    Abort { full_tag: FullPaymentTag },
    /// A sender's abort timer fired.
    AbortTimerFired { full_tag: FullPaymentTag, generation: u64 },
}

impl MasterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MasterEvent::CreateSender { .. } => "create_sender",
            MasterEvent::RemoveSender { .. } => "remove_sender",
            MasterEvent::SendPayment(_) => "send_payment",
            MasterEvent::ChanGotOnline => "chan_got_online",
            MasterEvent::AskForRoute => "ask_for_route",
            MasterEvent::RouteRequest(_) => "route_request",
            MasterEvent::RouteResponse(_) => "route_response",
            MasterEvent::ChannelFailedAtAmount(_) => "channel_failed_at_amount",
            MasterEvent::NodeFailed { .. } => "node_failed",
            MasterEvent::ChannelNotRoutable(_) => "channel_not_routable",
            MasterEvent::InFlightPayments(_) => "in_flight_payments",
            MasterEvent::LocalReject(_) => "local_reject",
            MasterEvent::RemoteFulfill(_) => "remote_fulfill",
            MasterEvent::RemoteReject(_) => "remote_reject",
            MasterEvent::CutIntoHalves { .. } => "cut_into_halves",
            MasterEvent::Abort { .. } => "abort",
            MasterEvent::AbortTimerFired { .. } => "abort_timer_fired",
        }
    }
}

/// Listener callbacks produced by senders, executed off the state lock.
#[derive(Clone)]
pub enum Notification {
    FirstPreimage {
        snapshot: SenderSnapshot,
        fulfill: RemoteFulfill,
    },
    WholePaymentSucceeded { snapshot: SenderSnapshot },
    WholePaymentFailed { snapshot: SenderSnapshot },
    SenderRemoved { snapshot: SenderSnapshot },
}

/// External effects of one handler invocation.
pub enum MasterOutput {
    /// Forward a filtered route request to the path-finder.
    FindRoute(FindRouteRequest),
    /// Teach the path-finder an assisted edge.
    LearnEdge(GraphEdge),
    /// Teach the path-finder a verified channel update.
    LearnUpdate(ChannelUpdate),
    /// Hand an add-HTLC command to a channel.
    DispatchHtlc { chan: ChanRef, cmd: AddHtlcCmd },
    /// Invoke listeners.
    Notify {
        listeners: Vec<Arc<dyn PaymentListener>>,
        notification: Notification,
    },
    /// (Re-)arm a sender's abort timer.
    ArmAbortTimer { full_tag: FullPaymentTag, generation: u64 },
}

/// Outputs to execute plus events to re-enqueue, in order.
#[derive(Default)]
pub struct Step {
    pub outputs: Vec<MasterOutput>,
    pub posts: Vec<MasterEvent>,
}

impl Step {
    fn absorb(&mut self, step: SenderStep) {
        self.outputs.extend(step.outputs);
        self.posts.extend(step.posts);
    }
}

// ============================================================================
// Master state
// ============================================================================

/// Route-request serialisation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterPhase {
    ExpectingPayments,
    WaitingForRoute,
}

pub struct MasterState {
    cfg: MasterConfig,
    phase: MasterPhase,
    payments: HashMap<FullPaymentTag, PaymentSender>,
    ledger: FailureLedger,
    entropy: Arc<dyn EntropySource>,
    sphinx: Arc<dyn SphinxCrypto>,
    chain_tip: Arc<dyn ChainTip>,
}

impl MasterState {
    pub fn new(
        cfg: MasterConfig,
        entropy: Arc<dyn EntropySource>,
        sphinx: Arc<dyn SphinxCrypto>,
        chain_tip: Arc<dyn ChainTip>,
    ) -> Self {
        Self {
            cfg,
            phase: MasterPhase::ExpectingPayments,
            payments: HashMap::new(),
            ledger: FailureLedger::new(),
            entropy,
            sphinx,
            chain_tip,
        }
    }

    pub fn cfg(&self) -> &MasterConfig {
        &self.cfg
    }

    pub fn phase(&self) -> MasterPhase {
        self.phase
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn sender_snapshot(&self, full_tag: &FullPaymentTag) -> Option<SenderSnapshot> {
        self.payments.get(full_tag).map(|sender| sender.snapshot())
    }

    pub fn registered_tags(&self) -> Vec<FullPaymentTag> {
        self.payments.keys().copied().collect()
    }

    /// Handles one event to completion. Pure state transition: all I/O
    /// leaves through the returned step.
    pub fn handle(&mut self, event: MasterEvent) -> Step {
        let mut step = Step::default();
        trace!("master: {}", event.name());
        match event {
            MasterEvent::CreateSender { full_tag, listeners } => {
                if self.payments.contains_key(&full_tag) {
                    warn!("payment {} is already registered", full_tag);
                } else {
                    self.payments
                        .insert(full_tag, PaymentSender::new(full_tag, listeners));
                }
            }

            MasterEvent::RemoveSender { full_tag } => match self.payments.remove(&full_tag) {
                Some(sender) => {
                    debug!("payment {} removed in phase {}", full_tag, sender.phase());
                    step.outputs.push(sender.removal_snapshot());
                }
                None => warn!("payment {} is not registered", full_tag),
            },

            MasterEvent::SendPayment(cmd) => {
                if cmd.clear_failures {
                    self.ledger
                        .reduce(Instant::now(), self.cfg.failed_chan_recovery);
                }
                for edge in &cmd.assisted_edges {
                    step.outputs.push(MasterOutput::LearnEdge(edge.clone()));
                }
                let full_tag = cmd.full_tag;
                match self.with_sender(&full_tag, |sender, ctx| sender.handle_send(cmd, ctx)) {
                    Some(sender_step) => {
                        step.absorb(sender_step);
                        step.posts.push(MasterEvent::AskForRoute);
                    }
                    None => warn!("send for unregistered payment {}", full_tag),
                }
            }

            MasterEvent::ChanGotOnline => {
                let broadcast = self.broadcast(|sender, ctx| sender.handle_chan_got_online(ctx));
                step.absorb(broadcast);
                step.posts.push(MasterEvent::AskForRoute);
            }

            MasterEvent::AskForRoute => {
                if self.phase == MasterPhase::ExpectingPayments {
                    let broadcast = self.broadcast(|sender, _| sender.handle_ask_for_route());
                    step.absorb(broadcast);
                }
            }

            MasterEvent::RouteRequest(request) => match self.phase {
                MasterPhase::ExpectingPayments => {
                    let used = self.used_capacities();
                    let ignores = self.ledger.route_ignores(
                        request.amount,
                        &used,
                        self.cfg.max_strange_node_failures,
                        self.cfg.max_direction_failures,
                    );
                    debug!(
                        "routing {} for {} (ignoring {} nodes, {} channels)",
                        request.amount,
                        request.full_tag,
                        ignores.nodes.len(),
                        ignores.channels.len()
                    );
                    step.outputs.push(MasterOutput::FindRoute(FindRouteRequest {
                        request,
                        ignore_nodes: ignores.nodes,
                        ignore_channels: ignores.channels,
                        ignore_directions: ignores.directions,
                    }));
                    self.phase = MasterPhase::WaitingForRoute;
                }
                MasterPhase::WaitingForRoute => {
                    // The part re-surfaces on the next AskForRoute.
                    trace!("route request dropped, one already outstanding");
                }
            },

            MasterEvent::RouteResponse(response) => {
                self.phase = MasterPhase::ExpectingPayments;
                let full_tag = response.full_tag();
                let delivered = self.with_sender(&full_tag, |sender, ctx| match response {
                    RouteResponse::Found { part_id, route, .. } => {
                        sender.handle_route_found(part_id, route, ctx)
                    }
                    RouteResponse::NoRoute { part_id, .. } => sender.handle_no_route(part_id, ctx),
                });
                if let Some(sender_step) = delivered {
                    step.absorb(sender_step);
                }
                step.posts.push(MasterEvent::AskForRoute);
            }

            MasterEvent::ChannelFailedAtAmount(dac) => {
                let used = self.used_capacities();
                self.apply_ledger_op(LedgerOp::ChannelFailedAtAmount(dac), &used, Instant::now());
            }

            MasterEvent::NodeFailed { node_id, increment } => {
                self.ledger.on_node_failed(node_id, increment);
            }

            MasterEvent::ChannelNotRoutable(desc) => {
                self.ledger.on_channel_not_routable(desc);
            }

            MasterEvent::InFlightPayments(bag) => {
                let broadcast = self.broadcast(|sender, _| sender.handle_in_flight_bag(&bag));
                step.absorb(broadcast);
            }

            MasterEvent::LocalReject(reject) => {
                let full_tag = reject.cmd.full_tag;
                let delivered =
                    self.with_sender(&full_tag, |sender, ctx| sender.handle_local_reject(reject, ctx));
                match delivered {
                    Some(sender_step) => step.absorb(sender_step),
                    None => trace!("local reject for unknown payment {}", full_tag),
                }
                step.posts.push(MasterEvent::AskForRoute);
            }

            MasterEvent::RemoteFulfill(fulfill) => {
                let full_tag = fulfill.our_add.full_tag;
                let delivered =
                    self.with_sender(&full_tag, |sender, _| sender.handle_remote_fulfill(fulfill));
                if let Some(sender_step) = delivered {
                    step.absorb(sender_step);
                }
                step.posts.push(MasterEvent::AskForRoute);
            }

            MasterEvent::RemoteReject(reject) => {
                let full_tag = reject.our_add().full_tag;
                // Ledger attribution is applied before the sender takes
                // its rescheduling decision for the failed part.
                let used = self.used_capacities();
                let analysis =
                    self.with_sender(&full_tag, |sender, ctx| sender.classify_remote_reject(&reject, ctx));
                match analysis {
                    Some(analysis) => {
                        let now = Instant::now();
                        for op in analysis.ledger_ops {
                            self.apply_ledger_op(op, &used, now);
                        }
                        step.outputs.extend(analysis.outputs);
                        let resolved = self.with_sender(&full_tag, |sender, ctx| {
                            sender.resolve_remote_plan(analysis.plan, ctx)
                        });
                        if let Some(sender_step) = resolved {
                            step.absorb(sender_step);
                        }
                    }
                    None => trace!("remote reject for unknown payment {}", full_tag),
                }
                step.posts.push(MasterEvent::AskForRoute);
            }

            MasterEvent::CutIntoHalves { full_tag, amount } => {
                let delivered = self.with_sender(&full_tag, |sender, ctx| {
                    sender.handle_cut_into_halves(amount, ctx)
                });
                if let Some(sender_step) = delivered {
                    step.absorb(sender_step);
                }
            }

            MasterEvent::Abort { full_tag } => {
                if let Some(sender_step) =
                    self.with_sender(&full_tag, |sender, _| sender.handle_abort(None))
                {
                    step.absorb(sender_step);
                }
            }

            MasterEvent::AbortTimerFired { full_tag, generation } => {
                if let Some(sender_step) =
                    self.with_sender(&full_tag, |sender, _| sender.handle_abort(Some(generation)))
                {
                    step.absorb(sender_step);
                }
            }
        }
        step
    }

    /// Processes an event and every self-posted continuation it causes, in
    /// FIFO order. This is the synchronous equivalent of what the worker
    /// loop does and makes ordering observable in tests.
    pub fn drive(&mut self, event: MasterEvent) -> Vec<MasterOutput> {
        let mut outputs = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(event);
        while let Some(next) = queue.pop_front() {
            let step = self.handle(next);
            outputs.extend(step.outputs);
            queue.extend(step.posts);
        }
        outputs
    }

    fn used_capacities(&self) -> HashMap<DescAndCapacity, Msat> {
        sendable::used_capacities(self.payments.values().flat_map(|sender| sender.parts()))
    }

    fn apply_ledger_op(
        &mut self,
        op: LedgerOp,
        used: &HashMap<DescAndCapacity, Msat>,
        now: Instant,
    ) {
        match op {
            LedgerOp::ChannelFailedAtAmount(dac) => {
                let used_now = used.get(&dac).copied().unwrap_or(Msat::ZERO);
                self.ledger.on_channel_failed(dac, used_now, now);
            }
            LedgerOp::NodeFailed { node_id, increment } => {
                self.ledger.on_node_failed(node_id, increment);
            }
            LedgerOp::ChannelNotRoutable(desc) => {
                self.ledger.on_channel_not_routable(desc);
            }
        }
    }

    fn with_sender<R, F>(&mut self, full_tag: &FullPaymentTag, f: F) -> Option<R>
    where
        F: FnOnce(&mut PaymentSender, &SenderCtx<'_>) -> R,
    {
        let Self {
            ref cfg,
            ref entropy,
            ref sphinx,
            ref chain_tip,
            ref mut payments,
            ..
        } = *self;
        let ctx = SenderCtx {
            cfg,
            entropy: entropy.as_ref(),
            sphinx: sphinx.as_ref(),
            chain_tip: chain_tip.as_ref(),
        };
        payments.get_mut(full_tag).map(|sender| f(sender, &ctx))
    }

    fn broadcast<F>(&mut self, mut f: F) -> SenderStep
    where
        F: FnMut(&mut PaymentSender, &SenderCtx<'_>) -> SenderStep,
    {
        let Self {
            ref cfg,
            ref entropy,
            ref sphinx,
            ref chain_tip,
            ref mut payments,
            ..
        } = *self;
        let ctx = SenderCtx {
            cfg,
            entropy: entropy.as_ref(),
            sphinx: sphinx.as_ref(),
            chain_tip: chain_tip.as_ref(),
        };
        let mut combined = SenderStep::default();
        for sender in payments.values_mut() {
            let step = f(sender, &ctx);
            combined.posts.extend(step.posts);
            combined.outputs.extend(step.outputs);
        }
        combined
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Queue-fed front of a [`MasterState`]: `process` enqueues from any task,
/// one worker drains in FIFO order and executes outputs with the lock
/// released. Cloning shares the same master.
#[derive(Clone)]
pub struct PaymentMaster {
    tx: UnboundedSender<MasterEvent>,
    state: Arc<Mutex<MasterState>>,
}

impl PaymentMaster {
    /// Starts the worker task. The returned handle runs until every
    /// `PaymentMaster` clone is dropped.
    pub fn spawn(state: MasterState, path_finder: Arc<dyn PathFinder>) -> (Self, JoinHandle<()>) {
        let abort_timeout = state.cfg.abort_timeout;
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(state));
        let worker = Worker {
            rx,
            tx: tx.clone(),
            state: Arc::clone(&state),
            path_finder,
            abort_timeout,
        };
        let handle = tokio::spawn(worker.run());
        (Self { tx, state }, handle)
    }

    /// Enqueues an event; never blocks.
    pub fn process(&self, event: MasterEvent) {
        if self.tx.send(event).is_err() {
            warn!("payment master worker is gone");
        }
    }

    pub async fn sender_snapshot(&self, full_tag: &FullPaymentTag) -> Option<SenderSnapshot> {
        self.state.lock().await.sender_snapshot(full_tag)
    }

    pub async fn registered_tags(&self) -> Vec<FullPaymentTag> {
        self.state.lock().await.registered_tags()
    }
}

struct Worker {
    rx: UnboundedReceiver<MasterEvent>,
    tx: UnboundedSender<MasterEvent>,
    state: Arc<Mutex<MasterState>>,
    path_finder: Arc<dyn PathFinder>,
    abort_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        debug!("payment master worker started");
        while let Some(event) = self.rx.recv().await {
            let step = {
                let mut state = self.state.lock().await;
                state.handle(event)
            }; // Lock released before any I/O.

            for post in step.posts {
                let _ = self.tx.send(post);
            }
            for output in step.outputs {
                self.execute(output).await;
            }
        }
        debug!("payment master worker stopped");
    }

    async fn execute(&self, output: MasterOutput) {
        match output {
            MasterOutput::FindRoute(request) => {
                let path_finder = Arc::clone(&self.path_finder);
                let tx = self.tx.clone();
                let full_tag = request.request.full_tag;
                let part_id = request.request.part_id;
                tokio::spawn(async move {
                    let response = match path_finder.find_route(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!("path-finder failed: {}", e);
                            RouteResponse::NoRoute { full_tag, part_id }
                        }
                    };
                    let _ = tx.send(MasterEvent::RouteResponse(response));
                });
            }
            MasterOutput::LearnEdge(edge) => self.path_finder.learn_edge(edge).await,
            MasterOutput::LearnUpdate(update) => self.path_finder.learn_update(update).await,
            MasterOutput::DispatchHtlc { chan, cmd } => {
                tokio::spawn(async move {
                    let channel_id = chan.channel_id();
                    if let Err(e) = chan.submit_add_htlc(cmd).await {
                        warn!("channel {} refused add-htlc: {}", channel_id, e);
                    }
                });
            }
            MasterOutput::Notify {
                listeners,
                notification,
            } => {
                tokio::spawn(async move {
                    for listener in listeners {
                        match notification.clone() {
                            Notification::FirstPreimage { snapshot, fulfill } => {
                                listener.got_first_preimage(snapshot, fulfill).await
                            }
                            Notification::WholePaymentSucceeded { snapshot } => {
                                listener.whole_payment_succeeded(snapshot).await
                            }
                            Notification::WholePaymentFailed { snapshot } => {
                                listener.whole_payment_failed(snapshot).await
                            }
                            Notification::SenderRemoved { snapshot } => {
                                listener.sender_removed(snapshot).await
                            }
                        }
                    }
                });
            }
            MasterOutput::ArmAbortTimer {
                full_tag,
                generation,
            } => {
                let tx = self.tx.clone();
                let delay = self.abort_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(MasterEvent::AbortTimerFired {
                        full_tag,
                        generation,
                    });
                });
            }
        }
    }
}
