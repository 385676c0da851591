//! Payment Sender FSM.
//!
//! One instance per logical payment. The sender owns the part map and
//! drives each part through reserve-channel, request-route, build-onion,
//! dispatch and resolution, applying the local and remote failure policy
//! along the way. It never performs I/O itself: every externally visible
//! effect leaves as a [`MasterOutput`] and every self-scheduled
//! continuation as a posted [`MasterEvent`].

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use log::{debug, trace, warn};

use crate::core::outbound::master::{MasterConfig, MasterEvent, MasterOutput, Notification};
use crate::core::outbound::model::{
    ChannelDesc, ChannelUpdate, DescAndCapacity, FailureMessage, Flight, FullPaymentTag,
    GraphEdge, InFlightBag, LocalFailureKind, LocalReject, LocalRejectReason, PartId, PartStatus,
    PaymentFailure, RemoteFulfill, RemoteReject, Route, RouteParams, RouteRequest, SendPayment,
    SenderPhase,
};
use crate::core::outbound::onion;
use crate::core::outbound::provider::{ChainTip, ChanRef, EntropySource, PaymentListener, SphinxCrypto};
use crate::core::outbound::sendable;
use crate::primitives::{CltvExpiryDelta, Msat, Ppm, ShortChannelId};
use crate::util;

// ============================================================================
// Context and step
// ============================================================================

/// Read-only master facilities handed to every sender handler.
pub struct SenderCtx<'a> {
    pub cfg: &'a MasterConfig,
    pub entropy: &'a dyn EntropySource,
    pub sphinx: &'a dyn SphinxCrypto,
    pub chain_tip: &'a dyn ChainTip,
}

/// What one handler invocation produced: events to re-enqueue on the
/// master and external effects to execute once state mutation is done.
#[derive(Default)]
pub struct SenderStep {
    pub posts: Vec<MasterEvent>,
    pub outputs: Vec<MasterOutput>,
}

/// Cloneable view of a sender, handed to listeners and host inspection.
#[derive(Debug, Clone)]
pub struct SenderSnapshot {
    pub full_tag: FullPaymentTag,
    pub phase: SenderPhase,
    pub cmd: Option<SendPayment>,
    pub parts: HashMap<PartId, PartStatus>,
    pub failures: Vec<PaymentFailure>,
    pub used_fee: Msat,
}

// ============================================================================
// Remote-failure analysis
// ============================================================================

/// Failure-ledger mutations requested by a sender. The master applies
/// these before the sender takes its next scheduling decision.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    ChannelFailedAtAmount(DescAndCapacity),
    NodeFailed { node_id: PublicKey, increment: u32 },
    ChannelNotRoutable(ChannelDesc),
}

/// What to do with the failed part once the ledger has been updated.
pub enum RejectPlan {
    /// Unknown part or stale event; nothing to do.
    Ignore,
    /// Terminal-phase cleanup: drop the part, re-check finalisation.
    DropOnly { part_id: PartId },
    /// A reject reached a sender that never assigned parts.
    InitReject { amount: Msat },
    /// The destination itself failed the part; no retry makes sense.
    Terminal {
        part_id: PartId,
        failure: PaymentFailure,
    },
    /// Run the retry policy for the failed part.
    Resolve {
        part_id: PartId,
        failure: PaymentFailure,
    },
}

/// Outcome of classifying one remote reject.
pub struct RemoteRejectAnalysis {
    pub ledger_ops: Vec<LedgerOp>,
    pub outputs: Vec<MasterOutput>,
    pub plan: RejectPlan,
}

// ============================================================================
// Sender
// ============================================================================

pub struct PaymentSender {
    full_tag: FullPaymentTag,
    listeners: Vec<Arc<dyn PaymentListener>>,
    phase: SenderPhase,
    cmd: Option<SendPayment>,
    parts: HashMap<PartId, PartStatus>,
    failures: Vec<PaymentFailure>,
    /// Guards the exactly-once final success/failure notification.
    final_notified: bool,
    /// Bumped on every assignment; stale timer firings are dropped.
    timer_generation: u64,
}

impl PaymentSender {
    pub fn new(full_tag: FullPaymentTag, listeners: Vec<Arc<dyn PaymentListener>>) -> Self {
        Self {
            full_tag,
            listeners,
            phase: SenderPhase::Init,
            cmd: None,
            parts: HashMap::new(),
            failures: Vec::new(),
            final_notified: false,
            timer_generation: 0,
        }
    }

    pub fn full_tag(&self) -> FullPaymentTag {
        self.full_tag
    }

    pub fn phase(&self) -> SenderPhase {
        self.phase
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartStatus> {
        self.parts.values()
    }

    /// Sum of route fees of parts currently in flight.
    pub fn used_fee(&self) -> Msat {
        self.parts
            .values()
            .filter_map(|part| part.flight().map(|flight| flight.fee))
            .sum()
    }

    /// What remains of the payment's fee reserve.
    pub fn fee_leftover(&self) -> Msat {
        self.cmd
            .as_ref()
            .map(|cmd| cmd.total_fee_reserve.saturating_sub(self.used_fee()))
            .unwrap_or(Msat::ZERO)
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        SenderSnapshot {
            full_tag: self.full_tag,
            phase: self.phase,
            cmd: self.cmd.clone(),
            parts: self.parts.clone(),
            failures: self.failures.clone(),
            used_fee: self.used_fee(),
        }
    }

    // ------------------------------------------------------------------------
    // Command handlers
    // ------------------------------------------------------------------------

    pub fn handle_send(&mut self, cmd: SendPayment, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        match self.phase {
            SenderPhase::Init | SenderPhase::Aborted => {
                debug!(
                    "payment {}: assigning {} over {} channels",
                    self.full_tag,
                    cmd.split.my_part,
                    cmd.allowed_chans.len()
                );
                self.parts.clear();
                self.failures.clear();
                self.final_notified = false;
                self.cmd = Some(cmd.clone());
                let candidates = sendable::right_now_sendable(
                    &cmd.allowed_chans,
                    cmd.total_fee_reserve,
                    &self.parts,
                );
                self.assign_to_chans(
                    ctx,
                    candidates,
                    cmd.split.my_part,
                    cmd.total_fee_reserve,
                    &mut step,
                );
            }
            phase => warn!("payment {}: send ignored in phase {}", self.full_tag, phase),
        }
        step
    }

    /// Picks the largest part that still needs a route and asks for one.
    /// At most one request per invocation; the master serialises them.
    pub fn handle_ask_for_route(&mut self) -> SenderStep {
        let mut step = SenderStep::default();
        if self.phase != SenderPhase::Pending {
            return step;
        }
        let Some(cmd) = &self.cmd else { return step };

        let best = self
            .parts
            .values()
            .filter(|part| matches!(part, PartStatus::WaitForRouteOrInFlight { flight: None, .. }))
            .max_by_key(|part| part.amount());

        if let Some(PartStatus::WaitForRouteOrInFlight {
            onion_key,
            amount,
            chan,
            ..
        }) = best
        {
            let request = RouteRequest {
                full_tag: self.full_tag,
                part_id: util::part_id_for(onion_key),
                source: util::sentinel_source_node(),
                target: cmd.target_node_id,
                amount: *amount,
                local_edge: fake_local_edge(chan),
                params: RouteParams {
                    fee_reserve: cmd.total_fee_reserve.saturating_sub(self.used_fee()),
                    route_max_length: cmd.router_conf.init_route_max_length,
                    route_max_cltv: cmd.router_conf.route_max_cltv,
                },
            };
            trace!(
                "payment {}: requesting route for {} via {}",
                self.full_tag,
                request.amount,
                chan.channel_id()
            );
            step.posts.push(MasterEvent::RouteRequest(request));
        }
        step
    }

    pub fn handle_route_found(
        &mut self,
        part_id: PartId,
        route: Route,
        ctx: &SenderCtx<'_>,
    ) -> SenderStep {
        let mut step = SenderStep::default();
        if self.phase != SenderPhase::Pending {
            trace!("payment {}: route ignored in phase {}", self.full_tag, self.phase);
            return step;
        }
        let Some(cmd) = self.cmd.clone() else { return step };

        let mut onion_failed_amount = None;
        match self.parts.get_mut(&part_id) {
            Some(PartStatus::WaitForRouteOrInFlight {
                onion_key,
                amount,
                chan,
                flight,
                fees_tried,
                ..
            }) if flight.is_none() => {
                let fee = route.fee_for(*amount);
                let final_expiry = cmd.chain_expiry.resolve(ctx.chain_tip.height());
                let payload = onion::final_payload(
                    *amount,
                    cmd.split.total_sum,
                    final_expiry,
                    &cmd.outer_payment_secret,
                    cmd.payee_metadata.as_deref(),
                    &cmd.onion_tlvs,
                    &cmd.user_custom_tlvs,
                );
                match onion::build_add_htlc(
                    ctx.sphinx,
                    onion_key,
                    cmd.full_tag,
                    &route,
                    *amount,
                    final_expiry,
                    payload,
                ) {
                    Ok(add) => {
                        debug!(
                            "payment {}: dispatching {} (+{} fee) over {} hops",
                            cmd.full_tag,
                            amount,
                            fee,
                            route.hops.len()
                        );
                        fees_tried.push(fee);
                        *flight = Some(Flight {
                            cmd: add.clone(),
                            route,
                            fee,
                        });
                        step.outputs.push(MasterOutput::DispatchHtlc {
                            chan: chan.clone(),
                            cmd: add,
                        });
                    }
                    Err(e) => {
                        // Inputs will not shrink on a retry, so re-routing
                        // cannot help.
                        warn!("payment {}: onion build failed: {}", cmd.full_tag, e);
                        onion_failed_amount = Some(*amount);
                    }
                }
            }
            _ => trace!("payment {}: stale route response", self.full_tag),
        }

        if let Some(amount) = onion_failed_amount {
            self.parts.remove(&part_id);
            self.failures.insert(
                0,
                PaymentFailure::Local {
                    kind: LocalFailureKind::OnionCreationFailure,
                    amount,
                },
            );
            self.abort_maybe_notify(None, &mut step);
        }
        step
    }

    pub fn handle_no_route(&mut self, part_id: PartId, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        if self.phase != SenderPhase::Pending {
            return step;
        }
        let Some(cmd) = self.cmd.clone() else { return step };
        let (amount, current, failed_before) = match self.parts.get(&part_id) {
            Some(PartStatus::WaitForRouteOrInFlight {
                amount,
                chan,
                flight: None,
                local_failed,
                ..
            }) => (*amount, chan.channel_id(), local_failed.clone()),
            _ => return step,
        };

        let alternative = sendable::right_now_sendable(&cmd.allowed_chans, self.fee_leftover(), &self.parts)
            .into_iter()
            .find(|(chan, chan_sendable)| {
                *chan_sendable >= amount
                    && chan.channel_id() != current
                    && !failed_before.contains(&chan.channel_id())
            });

        if let Some((new_chan, _)) = alternative {
            // The HTLC never went out, so the onion key is reusable.
            debug!(
                "payment {}: no route via {}, retrying via {}",
                self.full_tag,
                current,
                new_chan.channel_id()
            );
            if let Some(PartStatus::WaitForRouteOrInFlight {
                chan, local_failed, ..
            }) = self.parts.get_mut(&part_id)
            {
                local_failed.push(current);
                *chan = new_chan;
            }
        } else if self.outgoing_htlc_slots_left(ctx.cfg) >= 1 {
            debug!("payment {}: no route for {}, splitting", self.full_tag, amount);
            self.parts.remove(&part_id);
            step.posts.push(MasterEvent::CutIntoHalves {
                full_tag: self.full_tag,
                amount,
            });
        } else {
            self.parts.remove(&part_id);
            self.failures.insert(
                0,
                PaymentFailure::Local {
                    kind: LocalFailureKind::NoRoutesFound,
                    amount,
                },
            );
            self.abort_maybe_notify(None, &mut step);
        }
        step
    }

    pub fn handle_local_reject(&mut self, reject: LocalReject, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        let part_id = reject.cmd.part_id();
        match self.phase {
            SenderPhase::Init => {
                self.failures.insert(
                    0,
                    PaymentFailure::Local {
                        kind: LocalFailureKind::NotRetryingNoDetails,
                        amount: reject.cmd.first_amount,
                    },
                );
                self.abort_maybe_notify(None, &mut step);
            }
            SenderPhase::Pending => {
                let Some(cmd) = self.cmd.clone() else { return step };
                let (amount, current) = match self.parts.get(&part_id) {
                    Some(PartStatus::WaitForRouteOrInFlight { amount, chan, .. }) => {
                        (*amount, chan.channel_id())
                    }
                    _ => {
                        trace!("payment {}: reject for unknown part", self.full_tag);
                        return step;
                    }
                };

                if reject.reason == LocalRejectReason::InPrincipleNotSendable {
                    self.parts.remove(&part_id);
                    self.failures.insert(
                        0,
                        PaymentFailure::Local {
                            kind: LocalFailureKind::PaymentNotSendable,
                            amount,
                        },
                    );
                    self.abort_maybe_notify(None, &mut step);
                    return step;
                }

                let alternative =
                    sendable::right_now_sendable(&cmd.allowed_chans, self.fee_leftover(), &self.parts)
                        .into_iter()
                        .find(|(chan, chan_sendable)| {
                            *chan_sendable >= amount && chan.channel_id() != current
                        });

                match alternative {
                    Some((new_chan, _)) => {
                        debug!(
                            "payment {}: channel {} rejected ({}), retrying via {}",
                            self.full_tag,
                            current,
                            reject.reason,
                            new_chan.channel_id()
                        );
                        if let Some(PartStatus::WaitForRouteOrInFlight {
                            chan,
                            flight,
                            local_failed,
                            ..
                        }) = self.parts.get_mut(&part_id)
                        {
                            local_failed.push(current);
                            *chan = new_chan;
                            *flight = None;
                        }
                    }
                    None if reject.reason == LocalRejectReason::ChannelOffline => {
                        // The channel fell asleep under us; re-assign the
                        // amount from scratch, which may re-split it.
                        self.parts.remove(&part_id);
                        let max_fee = self.fee_leftover();
                        let candidates =
                            sendable::right_now_sendable(&cmd.allowed_chans, max_fee, &self.parts);
                        self.assign_to_chans(ctx, candidates, amount, max_fee, &mut step);
                    }
                    None => {
                        self.parts.remove(&part_id);
                        self.failures.insert(
                            0,
                            PaymentFailure::Local {
                                kind: LocalFailureKind::RunOutOfCapableChannels,
                                amount,
                            },
                        );
                        self.abort_maybe_notify(None, &mut step);
                    }
                }
            }
            SenderPhase::Succeeded => {
                self.parts.remove(&part_id);
                self.success_maybe_notify(None, &mut step);
            }
            SenderPhase::Aborted => {
                self.parts.remove(&part_id);
                self.abort_maybe_notify(None, &mut step);
            }
        }
        step
    }

    pub fn handle_chan_got_online(&mut self, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        if self.phase != SenderPhase::Pending {
            return step;
        }
        let Some(cmd) = self.cmd.clone() else { return step };
        let waiting = self
            .parts
            .iter()
            .find(|(_, part)| part.is_waiting_online())
            .map(|(part_id, part)| (*part_id, part.amount()));

        if let Some((part_id, amount)) = waiting {
            self.parts.remove(&part_id);
            let max_fee = self.fee_leftover();
            let candidates = sendable::right_now_sendable(&cmd.allowed_chans, max_fee, &self.parts);
            self.assign_to_chans(ctx, candidates, amount, max_fee, &mut step);
        }
        step
    }

    /// Splits an amount in two and assigns both halves sequentially, so
    /// the second assignment observes the first one's reservations.
    pub fn handle_cut_into_halves(&mut self, amount: Msat, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        if self.phase != SenderPhase::Pending {
            return step;
        }
        let Some(cmd) = self.cmd.clone() else { return step };

        let half = Msat(amount.msat() / 2);
        if half < ctx.cfg.min_part_amount {
            debug!(
                "payment {}: refusing to split {} below the part floor",
                self.full_tag, amount
            );
            self.failures.insert(
                0,
                PaymentFailure::Local {
                    kind: LocalFailureKind::NoRoutesFound,
                    amount,
                },
            );
            self.abort_maybe_notify(None, &mut step);
            return step;
        }

        for piece in [half, amount.saturating_sub(half)] {
            if self.phase != SenderPhase::Pending {
                break;
            }
            let max_fee = self.fee_leftover();
            let candidates = sendable::right_now_sendable(&cmd.allowed_chans, max_fee, &self.parts);
            self.assign_to_chans(ctx, candidates, piece, max_fee, &mut step);
        }
        step
    }

    /// Abort-timer firing or an upstream abort command. Stale timer
    /// generations are dropped; the payment only times out while parts are
    /// still parked waiting for a channel.
    pub fn handle_abort(&mut self, generation: Option<u64>) -> SenderStep {
        let mut step = SenderStep::default();
        if let Some(generation) = generation {
            if generation != self.timer_generation {
                trace!("payment {}: stale abort timer", self.full_tag);
                return step;
            }
        }
        if self.phase == SenderPhase::Pending && self.parts.values().any(|p| p.is_waiting_online()) {
            let waiting: Msat = self
                .parts
                .values()
                .filter(|part| part.is_waiting_online())
                .map(|part| part.amount())
                .sum();
            self.failures.insert(
                0,
                PaymentFailure::Local {
                    kind: LocalFailureKind::TimedOut,
                    amount: waiting,
                },
            );
            self.abort_maybe_notify(None, &mut step);
        }
        step
    }

    pub fn handle_remote_fulfill(&mut self, fulfill: RemoteFulfill) -> SenderStep {
        let mut step = SenderStep::default();
        if !util::preimage_matches(&fulfill.preimage, &self.full_tag.payment_hash) {
            warn!("payment {}: fulfill with foreign preimage", self.full_tag);
            return step;
        }
        let part_id = fulfill.our_add.part_id();
        match self.phase {
            SenderPhase::Init | SenderPhase::Pending => {
                debug!("payment {}: first preimage arrived", self.full_tag);
                // Snapshot before dropping the part so routes are intact.
                step.outputs.push(self.notify(Notification::FirstPreimage {
                    snapshot: self.snapshot(),
                    fulfill: fulfill.clone(),
                }));
                self.parts.remove(&part_id);
                self.phase = SenderPhase::Succeeded;
                self.success_maybe_notify(None, &mut step);
            }
            SenderPhase::Succeeded => {
                self.parts.remove(&part_id);
                self.success_maybe_notify(None, &mut step);
            }
            SenderPhase::Aborted => {
                self.parts.remove(&part_id);
                self.abort_maybe_notify(None, &mut step);
            }
        }
        step
    }

    pub fn handle_in_flight_bag(&mut self, bag: &InFlightBag) -> SenderStep {
        let mut step = SenderStep::default();
        match self.phase {
            SenderPhase::Succeeded => self.success_maybe_notify(Some(bag), &mut step),
            SenderPhase::Aborted => self.abort_maybe_notify(Some(bag), &mut step),
            _ => {}
        }
        step
    }

    pub fn removal_snapshot(&self) -> MasterOutput {
        self.notify(Notification::SenderRemoved {
            snapshot: self.snapshot(),
        })
    }

    // ------------------------------------------------------------------------
    // Remote failures
    // ------------------------------------------------------------------------

    /// First half of remote-reject handling: decrypt and attribute the
    /// failure, producing ledger mutations and a plan. The master applies
    /// the mutations, then calls [`Self::resolve_remote_plan`], so the
    /// ledger is current before any rescheduling happens.
    pub fn classify_remote_reject(
        &self,
        reject: &RemoteReject,
        ctx: &SenderCtx<'_>,
    ) -> RemoteRejectAnalysis {
        let mut analysis = RemoteRejectAnalysis {
            ledger_ops: Vec::new(),
            outputs: Vec::new(),
            plan: RejectPlan::Ignore,
        };
        let part_id = reject.our_add().part_id();

        if self.phase == SenderPhase::Init {
            analysis.plan = RejectPlan::InitReject {
                amount: reject.our_add().first_amount,
            };
            return analysis;
        }
        if self.phase.is_terminal() {
            if self.parts.contains_key(&part_id) {
                analysis.plan = RejectPlan::DropOnly { part_id };
            }
            return analysis;
        }
        let Some(cmd) = &self.cmd else { return analysis };
        let Some(PartStatus::WaitForRouteOrInFlight {
            amount,
            flight: Some(flight),
            ..
        }) = self.parts.get(&part_id)
        else {
            return analysis;
        };
        let route = flight.route.clone();

        match reject {
            RemoteReject::UpdateMalform { .. } => {
                // The failing hop did not say who it is; the node just in
                // front of the destination is the best guess.
                if let Some(blamed) = route.penultimate_node() {
                    analysis.ledger_ops.push(LedgerOp::NodeFailed {
                        node_id: blamed,
                        increment: ctx.cfg.max_strange_node_failures,
                    });
                }
                analysis.plan = RejectPlan::Resolve {
                    part_id,
                    failure: PaymentFailure::Local {
                        kind: LocalFailureKind::NodeCouldNotParseOnion,
                        amount: *amount,
                    },
                };
            }
            RemoteReject::UpdateFail { reason, .. } => {
                match ctx
                    .sphinx
                    .decrypt_failure(reason, &flight.cmd.packet_and_secrets.shared_secrets)
                {
                    Ok(packet) => {
                        let origin = packet.origin_node;
                        if origin == cmd.target_node_id
                            || packet.failure == FailureMessage::PaymentTimeout
                        {
                            // The destination spoke; this part is settled
                            // as far as retries are concerned.
                            analysis.plan = RejectPlan::Terminal {
                                part_id,
                                failure: PaymentFailure::Remote { route, packet },
                            };
                            return analysis;
                        }
                        match &packet.failure {
                            FailureMessage::Update { update } => {
                                self.attribute_update_failure(
                                    ctx,
                                    &route,
                                    origin,
                                    update,
                                    &mut analysis,
                                );
                            }
                            FailureMessage::Node => {
                                analysis.ledger_ops.push(LedgerOp::NodeFailed {
                                    node_id: origin,
                                    increment: ctx.cfg.max_strange_node_failures,
                                });
                            }
                            FailureMessage::Other { .. } => {
                                match route.edge_from(&origin) {
                                    Some(edge) => analysis
                                        .ledger_ops
                                        .push(LedgerOp::ChannelNotRoutable(edge.desc)),
                                    None => analysis.ledger_ops.push(LedgerOp::NodeFailed {
                                        node_id: origin,
                                        increment: ctx.cfg.max_strange_node_failures,
                                    }),
                                }
                            }
                            FailureMessage::PaymentTimeout => unreachable!("handled above"),
                        }
                        analysis.plan = RejectPlan::Resolve {
                            part_id,
                            failure: PaymentFailure::Remote { route, packet },
                        };
                    }
                    Err(e) => {
                        trace!("payment {}: undecryptable failure: {}", self.full_tag, e);
                        if let Some(blamed) = route.penultimate_node() {
                            analysis.ledger_ops.push(LedgerOp::NodeFailed {
                                node_id: blamed,
                                increment: ctx.cfg.max_strange_node_failures,
                            });
                        }
                        analysis.plan = RejectPlan::Resolve {
                            part_id,
                            failure: PaymentFailure::UnreadableRemote { route },
                        };
                    }
                }
            }
        }
        analysis
    }

    /// Attribution policy for a failure that carries a channel update.
    fn attribute_update_failure(
        &self,
        ctx: &SenderCtx<'_>,
        route: &Route,
        origin: PublicKey,
        update: &ChannelUpdate,
        analysis: &mut RemoteRejectAnalysis,
    ) {
        if !ctx.sphinx.is_node_update_sig_ok(update, &origin) {
            warn!(
                "payment {}: invalid update signature from {}",
                self.full_tag, origin
            );
            analysis.ledger_ops.push(LedgerOp::NodeFailed {
                node_id: origin,
                increment: ctx.cfg.max_strange_node_failures * 32,
            });
            return;
        }

        // A verified update is graph knowledge regardless of what we make
        // of the failure itself.
        analysis
            .outputs
            .push(MasterOutput::LearnUpdate(update.clone()));

        let our_edge = route.edge_from(&origin).cloned();
        if let Some(edge) = &our_edge {
            if !update.enabled {
                analysis
                    .ledger_ops
                    .push(LedgerOp::ChannelNotRoutable(edge.desc));
            }
        }

        match our_edge {
            Some(edge) if update.short_channel_id != edge.desc.short_channel_id => {
                // The node failed a different channel than the one we
                // picked through it.
                analysis
                    .ledger_ops
                    .push(LedgerOp::ChannelFailedAtAmount(edge.desc_and_capacity()));
                analysis.ledger_ops.push(LedgerOp::NodeFailed {
                    node_id: origin,
                    increment: 1,
                });
            }
            Some(edge) if update.same_policy_as(&edge.update) => {
                // Policy unchanged, the channel is most likely imbalanced
                // at this amount.
                analysis
                    .ledger_ops
                    .push(LedgerOp::ChannelFailedAtAmount(edge.desc_and_capacity()));
            }
            _ => {
                // Fees or CLTV changed; the channel may well work on the
                // next try with the fresh update installed.
                analysis.ledger_ops.push(LedgerOp::NodeFailed {
                    node_id: origin,
                    increment: 1,
                });
            }
        }
    }

    /// Second half of remote-reject handling, run after the ledger ops
    /// above have been applied.
    pub fn resolve_remote_plan(&mut self, plan: RejectPlan, ctx: &SenderCtx<'_>) -> SenderStep {
        let mut step = SenderStep::default();
        match plan {
            RejectPlan::Ignore => {}
            RejectPlan::DropOnly { part_id } => {
                self.parts.remove(&part_id);
                match self.phase {
                    SenderPhase::Succeeded => self.success_maybe_notify(None, &mut step),
                    SenderPhase::Aborted => self.abort_maybe_notify(None, &mut step),
                    _ => {}
                }
            }
            RejectPlan::InitReject { amount } => {
                self.failures.insert(
                    0,
                    PaymentFailure::Local {
                        kind: LocalFailureKind::NotRetryingNoDetails,
                        amount,
                    },
                );
                self.abort_maybe_notify(None, &mut step);
            }
            RejectPlan::Terminal { part_id, failure } => {
                self.parts.remove(&part_id);
                self.failures.insert(0, failure);
                self.abort_maybe_notify(None, &mut step);
            }
            RejectPlan::Resolve { part_id, failure } => {
                self.resolve_remote_fail(part_id, failure, ctx, &mut step);
            }
        }
        step
    }

    fn resolve_remote_fail(
        &mut self,
        part_id: PartId,
        failure: PaymentFailure,
        ctx: &SenderCtx<'_>,
        step: &mut SenderStep,
    ) {
        let Some(part) = self.parts.remove(&part_id) else { return };
        self.failures.insert(0, failure);
        let PartStatus::WaitForRouteOrInFlight {
            amount,
            fees_tried,
            remote_attempts,
            ..
        } = part
        else {
            return;
        };
        let Some(cmd) = self.cmd.clone() else { return };

        let alternative =
            sendable::right_now_sendable(&cmd.allowed_chans, self.fee_leftover(), &self.parts)
                .into_iter()
                .find(|(_, chan_sendable)| *chan_sendable >= amount);

        match alternative {
            Some((chan, _)) if remote_attempts < ctx.cfg.max_remote_attempts => {
                // The HTLC went out last time, so a fresh session key makes
                // the retry a different payment attempt on the wire.
                let retry = PartStatus::WaitForRouteOrInFlight {
                    onion_key: ctx.entropy.fresh_session_key(),
                    amount,
                    chan,
                    flight: None,
                    fees_tried,
                    local_failed: Vec::new(),
                    remote_attempts: remote_attempts + 1,
                };
                debug!(
                    "payment {}: remote retry {} of {}",
                    self.full_tag,
                    remote_attempts + 1,
                    ctx.cfg.max_remote_attempts
                );
                self.parts.insert(retry.part_id(), retry);
            }
            _ if self.outgoing_htlc_slots_left(ctx.cfg) >= 2 => {
                step.posts.push(MasterEvent::CutIntoHalves {
                    full_tag: self.full_tag,
                    amount,
                });
            }
            _ => {
                self.failures.insert(
                    0,
                    PaymentFailure::Local {
                        kind: LocalFailureKind::RunOutOfRetryAttempts,
                        amount,
                    },
                );
                self.abort_maybe_notify(None, step);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------------

    fn assign_to_chans(
        &mut self,
        ctx: &SenderCtx<'_>,
        mut candidates: Vec<(ChanRef, Msat)>,
        amount: Msat,
        max_fee: Msat,
        step: &mut SenderStep,
    ) {
        let Some(cmd) = self.cmd.clone() else { return };

        ctx.entropy.shuffle_candidates(&mut candidates);
        // Stable sort: direct channels to the target come first, shuffled
        // order is preserved within each group.
        candidates.sort_by_key(|(chan, _)| {
            if chan.remote_node_id() == cmd.target_node_id {
                0
            } else {
                1
            }
        });

        let mut leftover = amount;
        let mut assigned = Vec::new();
        for (chan, chan_sendable) in candidates {
            if leftover.is_zero() {
                break;
            }
            let mut take = leftover.min(chan_sendable);
            if take < chan.min_sendable() {
                // Bump the trailing remainder up to what the channel will
                // actually carry; the overshoot is bounded by min_sendable.
                take = chan.min_sendable();
            }
            assigned.push(PartStatus::WaitForRouteOrInFlight {
                onion_key: ctx.entropy.fresh_session_key(),
                amount: take,
                chan,
                flight: None,
                fees_tried: Vec::new(),
                local_failed: Vec::new(),
                remote_attempts: 0,
            });
            leftover = leftover.saturating_sub(take);
        }

        if leftover.is_zero() {
            debug!(
                "payment {}: assigned {} across {} parts",
                self.full_tag,
                amount,
                assigned.len()
            );
            for part in assigned {
                self.parts.insert(part.part_id(), part);
            }
            self.phase = SenderPhase::Pending;
            self.arm_abort_timer(step);
        } else if sendable::sleeping_sendable(&cmd.allowed_chans, max_fee) >= leftover {
            debug!(
                "payment {}: parking {} until a channel wakes up",
                self.full_tag, leftover
            );
            for part in assigned {
                self.parts.insert(part.part_id(), part);
            }
            let wait = PartStatus::WaitForChanOnline {
                onion_key: ctx.entropy.fresh_session_key(),
                amount: leftover,
            };
            self.parts.insert(wait.part_id(), wait);
            self.phase = SenderPhase::Pending;
            self.arm_abort_timer(step);
        } else {
            self.failures.insert(
                0,
                PaymentFailure::Local {
                    kind: LocalFailureKind::NotEnoughFunds,
                    amount,
                },
            );
            self.abort_maybe_notify(None, step);
        }
    }

    fn arm_abort_timer(&mut self, step: &mut SenderStep) {
        self.timer_generation += 1;
        step.outputs.push(MasterOutput::ArmAbortTimer {
            full_tag: self.full_tag,
            generation: self.timer_generation,
        });
    }

    // ------------------------------------------------------------------------
    // Finalisation
    // ------------------------------------------------------------------------

    fn outgoing_htlc_slots_left(&self, cfg: &MasterConfig) -> usize {
        let chans = self
            .cmd
            .as_ref()
            .map(|cmd| cmd.allowed_chans.len())
            .unwrap_or(0);
        (chans * cfg.max_in_channel_htlcs as usize).saturating_sub(self.parts.len())
    }

    fn has_in_flight(&self) -> bool {
        self.parts.values().any(|part| part.is_in_flight())
    }

    /// Whether any channel still carries an HTLC with this payment's tag,
    /// according to the freshest information available: the reported bag
    /// if one is at hand, plus a live look at the payment's own channels.
    fn channel_leftovers(&self, bag: Option<&InFlightBag>) -> bool {
        let in_bag = bag.map_or(false, |bag| bag.contains(&self.full_tag));
        let live = self.cmd.as_ref().map_or(false, |cmd| {
            cmd.allowed_chans.iter().any(|chan| {
                chan.outgoing()
                    .iter()
                    .any(|htlc| htlc.full_tag == self.full_tag)
            })
        });
        in_bag || live
    }

    fn abort_maybe_notify(&mut self, bag: Option<&InFlightBag>, step: &mut SenderStep) {
        self.phase = SenderPhase::Aborted;
        if !self.has_in_flight() && !self.channel_leftovers(bag) && !self.final_notified {
            self.final_notified = true;
            step.outputs.push(self.notify(Notification::WholePaymentFailed {
                snapshot: self.snapshot(),
            }));
        }
    }

    fn success_maybe_notify(&mut self, bag: Option<&InFlightBag>, step: &mut SenderStep) {
        if self.phase == SenderPhase::Succeeded
            && !self.has_in_flight()
            && !self.channel_leftovers(bag)
            && !self.final_notified
        {
            self.final_notified = true;
            step.outputs.push(self.notify(Notification::WholePaymentSucceeded {
                snapshot: self.snapshot(),
            }));
        }
    }

    fn notify(&self, notification: Notification) -> MasterOutput {
        MasterOutput::Notify {
            listeners: self.listeners.clone(),
            notification,
        }
    }
}

/// A fabricated edge from the sentinel source to the channel peer, so the
/// path-finder can treat our own channel like any other first hop. It
/// charges nothing and the scid is derived from the channel id.
fn fake_local_edge(chan: &ChanRef) -> GraphEdge {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&chan.channel_id().0[..8]);
    let scid = ShortChannelId(u64::from_be_bytes(raw));
    GraphEdge {
        desc: ChannelDesc {
            short_channel_id: scid,
            from: util::sentinel_source_node(),
            to: chan.remote_node_id(),
        },
        capacity: chan.max_send_in_flight().max(chan.available_for_send()),
        update: ChannelUpdate {
            short_channel_id: scid,
            timestamp: 0,
            enabled: true,
            cltv_expiry_delta: CltvExpiryDelta(0),
            htlc_minimum: chan.min_sendable(),
            htlc_maximum: chan.max_send_in_flight(),
            fee_base: Msat::ZERO,
            fee_proportional: Ppm(0),
            signature: Vec::new(),
        },
    }
}
